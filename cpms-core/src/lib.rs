//! CPMS Core Library
//!
//! Platform-facing contracts of the charge point management engine: the
//! publish/subscribe [`EventBus`] seam, the domain events the gateway emits
//! and the command request/response envelopes the business layer exchanges
//! with it.

pub mod bus;
pub mod command;
pub mod events;

pub use bus::{BusError, BusMessage, EventBus, MemoryBus, Subscription};
pub use command::{CommandRequest, CommandResponse};
pub use events::{topics, DomainEvent};
