//! # CPMS Gateway
//!
//! OCPP-J 1.6 central system side of a charge point management platform.
//!
//! Chargers connect over WebSocket to `/ocpp/<identity>`. The gateway answers
//! their CALLs and publishes domain events; the business layer sends commands
//! back through the event bus and receives one response per keyed request.
//!
//! ## Architecture
//!
//! ```text
//!  Charge points                                  Business layer
//!       │ ws, OCPP-J 1.6                               ▲   │
//!       ▼                                     events   │   │ commands
//! ┌──────────────────┐   ┌───────────────────┐      ┌──┴───▼──┐
//! │ ProtocolGateway  │──►│ ConnectionRegistry│      │EventBus │
//! │ (server+handlers)│   └─────────▲─────────┘      └──▲───┬──┘
//! └───┬──────────────┘             │                   │   │
//!     │ CALLRESULT/ERROR  ┌────────┴──────────┐   ┌────┴───▼─────┐
//!     └──────────────────►│ CommandDispatcher │◄──│CommandIntake │
//!                         └───────────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use cpms_core::MemoryBus;
//! use cpms_gateway::{EngineConfig, Engine, StaticDirectory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new("0.0.0.0:9000".parse()?);
//!     let directory = StaticDirectory::from_identities(["CP001"]);
//!
//!     let engine = Engine::new(config, Arc::new(MemoryBus::new()), Arc::new(directory));
//!     engine.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod intake;
pub mod ocpp;
pub mod registry;

pub use config::{EngineConfig, GatewayConfig, IntakeConfig};
pub use dispatcher::{CommandDispatcher, Correlation, DEFAULT_COMMAND_TIMEOUT};
pub use engine::{Engine, RunningEngine};
pub use error::{CommandError, GatewayError, IdentityError};
pub use gateway::{Admission, ProtocolGateway};
pub use identity::{AcceptAll, ChargerRecord, IdentityValidator, StaticDirectory};
pub use intake::CommandIntake;
pub use registry::{ChargerConnection, ConnectionRegistry};

// Re-export key protocol types
pub use ocpp::{Action, ChargerCommand, ErrorCode, OcppMessage, ResetType};
