//! OCPP-J 1.6 protocol layer
//!
//! - `types`: payload types for the actions this central system handles
//! - `messages`: CALL / CALLRESULT / CALLERROR framing
//! - `commands`: typed central-system-initiated commands

pub mod commands;
pub mod messages;
pub mod types;

pub use commands::ChargerCommand;
pub use messages::*;
pub use types::*;
