//! Charger-initiated CALL handlers
//!
//! Each handler is a pure function of the charger identity, the payload and
//! the current time: it returns the synchronous reply plus the domain event
//! to publish. The gateway does the I/O.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use cpms_core::events::*;
use cpms_core::DomainEvent;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::ocpp::*;

/// Reply to a charger-initiated CALL
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// CALLRESULT payload
    Result(Value),
    /// CALLERROR
    Error { code: ErrorCode, description: String },
}

impl Reply {
    /// Frame answering the CALL `message_id`
    pub fn into_message(self, message_id: String) -> Result<OcppMessage, OcppError> {
        Ok(match self {
            Reply::Result(payload) => OcppMessage::CallResult(CallResult::new(message_id, payload)?),
            Reply::Error { code, description } => {
                OcppMessage::CallError(CallError::new(message_id, code, description))
            }
        })
    }
}

/// Reply plus the event the CALL produced
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub reply: Reply,
    pub event: Option<DomainEvent>,
}

impl Handled {
    fn reply(payload: Value) -> Self {
        Self {
            reply: Reply::Result(payload),
            event: None,
        }
    }

    fn with_event(payload: Value, event: DomainEvent) -> Self {
        Self {
            reply: Reply::Result(payload),
            event: Some(event),
        }
    }

    fn error(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            reply: Reply::Error {
                code,
                description: description.into(),
            },
            event: None,
        }
    }
}

/// Issues `txn_<epochMillis>_<connectorId>` ids.
///
/// The millisecond part is strictly increasing across the process, so two
/// starts in the same millisecond still get distinct ids.
#[derive(Debug, Default)]
pub struct TransactionIds {
    last_millis: AtomicI64,
}

impl TransactionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: DateTime<Utc>, connector_id: u32) -> String {
        let millis = now.timestamp_millis();
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(millis.max(last + 1))
            })
            .unwrap_or(millis);
        let issued = millis.max(previous + 1);

        format!("txn_{}_{}", issued, connector_id)
    }
}

/// Everything a handler may read besides the payload
pub struct HandlerContext<'a> {
    pub charger_id: &'a str,
    pub now: DateTime<Utc>,
    /// Heartbeat interval handed out on boot (seconds)
    pub heartbeat_interval: u32,
    pub id_tag_expiry: chrono::Duration,
    pub transaction_ids: &'a TransactionIds,
}

/// Route a CALL to its handler
pub fn handle_call(ctx: &HandlerContext<'_>, action: &str, payload: &Value) -> Handled {
    let action = match action.parse::<Action>() {
        Ok(action) => action,
        Err(_) => {
            return Handled::error(
                ErrorCode::NotImplemented,
                format!("Action {} is not implemented", action),
            )
        }
    };

    let outcome = match action {
        Action::BootNotification => Ok(boot_notification(ctx, payload)),
        Action::Heartbeat => Ok(heartbeat(ctx)),
        Action::StatusNotification => status_notification(ctx, payload),
        Action::StartTransaction => start_transaction(ctx, payload),
        Action::StopTransaction => stop_transaction(ctx, payload),
        Action::MeterValues => meter_values(ctx, payload),
        Action::Authorize => authorize(payload),
        // Central-system-initiated actions are not accepted from chargers
        other => Err(Handled::error(
            ErrorCode::NotSupported,
            format!("{} is sent by the central system, not the charge point", other),
        )),
    };

    outcome.unwrap_or_else(|rejected| rejected)
}

fn decode<T: DeserializeOwned>(action: &str, payload: &Value) -> Result<T, Handled> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        debug!("Invalid {} payload: {}", action, e);
        Handled::error(
            ErrorCode::FormationViolation,
            format!("Invalid {} payload: {}", action, e),
        )
    })
}

fn boot_notification(ctx: &HandlerContext<'_>, payload: &Value) -> Handled {
    let reply = BootNotificationResponse {
        status: RegistrationStatus::Accepted,
        current_time: ctx.now,
        interval: ctx.heartbeat_interval,
    };

    Handled::with_event(
        json!(reply),
        DomainEvent::ChargerBoot(ChargerBoot {
            unique_id: ctx.charger_id.to_string(),
            charger_info: payload.clone(),
            timestamp: ctx.now,
        }),
    )
}

fn heartbeat(ctx: &HandlerContext<'_>) -> Handled {
    Handled::reply(json!(HeartbeatResponse {
        current_time: ctx.now
    }))
}

fn status_notification(ctx: &HandlerContext<'_>, payload: &Value) -> Result<Handled, Handled> {
    let req: StatusNotificationRequest = decode("StatusNotification", payload)?;

    Ok(Handled::with_event(
        json!({}),
        DomainEvent::StatusUpdate(StatusUpdate {
            unique_id: ctx.charger_id.to_string(),
            status: req.status,
            connector_id: req.connector_id,
            error_code: req.error_code,
            timestamp: req.timestamp.unwrap_or(ctx.now),
        }),
    ))
}

fn start_transaction(ctx: &HandlerContext<'_>, payload: &Value) -> Result<Handled, Handled> {
    let req: StartTransactionRequest = decode("StartTransaction", payload)?;
    let transaction_id = ctx.transaction_ids.next(ctx.now, req.connector_id);

    let reply = StartTransactionResponse {
        transaction_id: transaction_id.clone(),
        id_tag_info: IdTagInfo::accepted_until(ctx.now + ctx.id_tag_expiry),
    };

    Ok(Handled::with_event(
        json!(reply),
        DomainEvent::SessionStartRequested(SessionStartRequested {
            transaction_id,
            charger_id: ctx.charger_id.to_string(),
            connector_id: req.connector_id,
            id_tag: req.id_tag,
            meter_start: req.meter_start,
            timestamp: req.timestamp.unwrap_or(ctx.now),
            reservation_id: req.reservation_id,
        }),
    ))
}

fn stop_transaction(ctx: &HandlerContext<'_>, payload: &Value) -> Result<Handled, Handled> {
    let req: StopTransactionRequest = decode("StopTransaction", payload)?;

    let reply = StopTransactionResponse {
        id_tag_info: IdTagInfo::accepted(),
    };

    Ok(Handled::with_event(
        json!(reply),
        DomainEvent::SessionStopRequested(SessionStopRequested {
            transaction_id: req.transaction_id,
            meter_stop: req.meter_stop,
            timestamp: req.timestamp.unwrap_or(ctx.now),
            reason: req.reason,
            transaction_data: req.transaction_data,
        }),
    ))
}

fn meter_values(ctx: &HandlerContext<'_>, payload: &Value) -> Result<Handled, Handled> {
    let req: MeterValuesRequest = decode("MeterValues", payload)?;

    Ok(Handled::with_event(
        json!({}),
        DomainEvent::SessionMeterValues(SessionMeterValues {
            connector_id: req.connector_id,
            transaction_id: req.transaction_id,
            meter_values: req.meter_value,
            timestamp: ctx.now,
        }),
    ))
}

fn authorize(payload: &Value) -> Result<Handled, Handled> {
    let _req: AuthorizeRequest = decode("Authorize", payload)?;

    Ok(Handled::reply(json!(AuthorizeResponse {
        id_tag_info: IdTagInfo::accepted()
    })))
}
