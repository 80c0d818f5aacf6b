//! Error types of the gateway crate

use std::time::Duration;

use cpms_core::BusError;
use serde_json::Value;
use thiserror::Error;

use crate::ocpp::{Action, ErrorCode, OcppError};

/// Failure of an outbound command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Charger {0} is not connected")]
    NotConnected(String),

    #[error("{action} to {charger_id} timed out after {timeout:?}")]
    Timeout {
        charger_id: String,
        action: Action,
        timeout: Duration,
    },

    #[error("Charger returned {code}: {description}")]
    Protocol {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Unknown command action: {0}")]
    UnknownAction(String),

    #[error("Invalid parameters for {action}: {reason}")]
    InvalidParams { action: Action, reason: String },

    #[error("Frame encoding failed: {0}")]
    Encoding(#[from] OcppError),
}

impl CommandError {
    /// Stable code reported in command responses
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::NotConnected(_) => "NotConnected",
            CommandError::Timeout { .. } => "CommandTimeout",
            CommandError::Protocol { .. } => "ProtocolError",
            CommandError::UnknownAction(_) => "UnknownCommandAction",
            CommandError::InvalidParams { .. } => "InvalidParams",
            CommandError::Encoding(_) => "InternalError",
        }
    }
}

/// Errors raised while accepting or serving charger connections
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Connection rejected for identity {0:?}")]
    ConnectionRejected(String),

    #[error("Identity lookup failed: {0}")]
    IdentityLookup(#[from] IdentityError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Gateway task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Identity directory failure (not the same as an unknown identity)
#[derive(Debug, Error)]
#[error("{0}")]
pub struct IdentityError(pub String);
