//! Domain events published by the gateway
//!
//! Each event is an immutable fact about a charger. Payload field names are
//! camelCase because downstream consumers read them as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::BusMessage;

/// Topic names
pub mod topics {
    pub const CHARGER_CONNECTED: &str = "charger.connected";
    pub const CHARGER_DISCONNECTED: &str = "charger.disconnected";
    pub const CHARGER_BOOT: &str = "charger.boot";
    pub const STATUS_UPDATE: &str = "charge_point.status_update";
    pub const SESSION_START_REQUESTED: &str = "session.start_requested";
    pub const SESSION_STOP_REQUESTED: &str = "session.stop_requested";
    pub const SESSION_METER_VALUES: &str = "session.meter_values";

    /// Inbound command requests (consumed by the command intake)
    pub const COMMAND_REQUEST: &str = "charger.command";
    /// Command outcomes, keyed by the request's `responseKey`
    pub const COMMAND_RESPONSE: &str = "charger.command_response";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerConnected {
    pub charger_id: String,
    pub charger_code: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerDisconnected {
    pub charger_id: String,
    pub charger_code: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerBoot {
    pub unique_id: String,
    /// BootNotification payload as sent by the charger
    pub charger_info: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub unique_id: String,
    pub status: String,
    pub connector_id: u32,
    pub error_code: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartRequested {
    pub transaction_id: String,
    pub charger_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i64,
    pub timestamp: DateTime<Utc>,
    pub reservation_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStopRequested {
    /// Echoed back by the charger; kept as-is since chargers differ on string vs number
    pub transaction_id: Value,
    pub meter_stop: i64,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub transaction_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeterValues {
    pub connector_id: u32,
    pub transaction_id: Option<Value>,
    /// Raw `meterValue` array; energy extraction happens downstream
    pub meter_values: Value,
    pub timestamp: DateTime<Utc>,
}

/// Any event the gateway can publish
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    ChargerConnected(ChargerConnected),
    ChargerDisconnected(ChargerDisconnected),
    ChargerBoot(ChargerBoot),
    StatusUpdate(StatusUpdate),
    SessionStartRequested(SessionStartRequested),
    SessionStopRequested(SessionStopRequested),
    SessionMeterValues(SessionMeterValues),
}

impl DomainEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::ChargerConnected(_) => topics::CHARGER_CONNECTED,
            DomainEvent::ChargerDisconnected(_) => topics::CHARGER_DISCONNECTED,
            DomainEvent::ChargerBoot(_) => topics::CHARGER_BOOT,
            DomainEvent::StatusUpdate(_) => topics::STATUS_UPDATE,
            DomainEvent::SessionStartRequested(_) => topics::SESSION_START_REQUESTED,
            DomainEvent::SessionStopRequested(_) => topics::SESSION_STOP_REQUESTED,
            DomainEvent::SessionMeterValues(_) => topics::SESSION_METER_VALUES,
        }
    }

    /// JSON payload of the event
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            DomainEvent::ChargerConnected(e) => serde_json::to_value(e),
            DomainEvent::ChargerDisconnected(e) => serde_json::to_value(e),
            DomainEvent::ChargerBoot(e) => serde_json::to_value(e),
            DomainEvent::StatusUpdate(e) => serde_json::to_value(e),
            DomainEvent::SessionStartRequested(e) => serde_json::to_value(e),
            DomainEvent::SessionStopRequested(e) => serde_json::to_value(e),
            DomainEvent::SessionMeterValues(e) => serde_json::to_value(e),
        }
    }

    /// Bus message keyed by the originating charger
    pub fn to_message(&self, charger_id: &str) -> Result<BusMessage, serde_json::Error> {
        Ok(BusMessage::keyed(self.topic(), charger_id, self.payload()?))
    }
}
