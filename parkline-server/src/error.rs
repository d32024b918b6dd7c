// Parkline Server - HTTP API, edge gateways and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Startup errors

use thiserror::Error;

/// Errors that stop the server before or while serving
#[derive(Error, Debug)]
pub enum ServerError {
    /// Core failed to load or provision its state
    #[error("Core error: {0}")]
    Core(#[from] parkline::ParkError),

    /// A gateway could not be built
    #[error("Gateway error: {0}")]
    Gateway(#[from] parkline_gateway::GatewayError),

    /// Listener could not bind or the server failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command-line value out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for server startup
pub type Result<T> = std::result::Result<T, ServerError>;
