//! Outbound command correlation
//!
//! Every command sent to a charger becomes a pending entry keyed by its CALL
//! message id. The entry owns the oneshot sender for the caller's result and
//! the deadline task for its timeout. Whoever removes the entry from the table
//! first (the matching CALLRESULT/CALLERROR or the deadline) settles it, so a
//! command is resolved exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::ocpp::*;
use crate::registry::ConnectionRegistry;

/// Default time a charger gets to answer a command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Command awaiting the charger's answer
struct PendingCommand {
    action: Action,
    charger_id: String,
    reply: oneshot::Sender<Result<Value, CommandError>>,
    deadline: JoinHandle<()>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingCommand>>>;

/// What happened to an inbound CALLRESULT/CALLERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Settled a pending command
    Delivered,
    /// No pending command with that id (already timed out, answered, or never sent)
    Stale,
}

/// Sends CALLs to chargers and correlates their replies
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    pending: PendingTable,
    sequence: AtomicU64,
    default_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            pending: Arc::new(Mutex::new(HashMap::new())),
            sequence: AtomicU64::new(0),
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Set the timeout used by [`execute`](Self::execute) and the typed operations
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of commands still awaiting an answer
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Timestamp plus a process-wide counter; the counter alone never repeats
    fn next_message_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", Utc::now().timestamp_millis(), seq)
    }

    /// Send `[2, id, action, payload]` and wait for the correlated reply
    pub async fn send_command(
        &self,
        charger_id: &str,
        action: Action,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CommandError> {
        let connection = self
            .registry
            .get(charger_id)
            .ok_or_else(|| CommandError::NotConnected(charger_id.to_string()))?;

        let message_id = self.next_message_id();
        let frame = Call::new(message_id.clone(), action, payload)?.to_text()?;

        let (reply_tx, mut reply_rx) = oneshot::channel();

        // Registered before the write so a fast reply is never seen as stale
        {
            let mut pending = self.pending.lock();
            let deadline = spawn_deadline(
                self.pending.clone(),
                message_id.clone(),
                timeout,
            );
            pending.insert(
                message_id.clone(),
                PendingCommand {
                    action,
                    charger_id: charger_id.to_string(),
                    reply: reply_tx,
                    deadline,
                },
            );
        }

        debug!("Sending {} to {}: {}", action, charger_id, frame);

        if connection.send_text(frame).await.is_err() {
            if let Some(cmd) = self.pending.lock().remove(&message_id) {
                cmd.deadline.abort();
            }
            // The deadline may have settled it while the queue was full
            if let Ok(settled) = reply_rx.try_recv() {
                return settled;
            }
            warn!("Connection to {} closed before {} could be sent", charger_id, action);
            return Err(CommandError::NotConnected(charger_id.to_string()));
        }

        match reply_rx.await {
            Ok(result) => result,
            // Entry dropped without being settled; only happens on teardown
            Err(_) => Err(CommandError::NotConnected(charger_id.to_string())),
        }
    }

    /// Settle the pending command for `message_id`
    pub fn handle_response(&self, message_id: &str, payload: Value, is_error: bool) -> Correlation {
        let entry = self.pending.lock().remove(message_id);

        let Some(cmd) = entry else {
            debug!("Discarding stale response for message {}", message_id);
            return Correlation::Stale;
        };

        cmd.deadline.abort();

        let result = if is_error {
            let err = protocol_error(payload);
            warn!("{} on {} failed: {}", cmd.action, cmd.charger_id, err);
            Err(err)
        } else {
            debug!("{} on {} answered", cmd.action, cmd.charger_id);
            Ok(payload)
        };

        if cmd.reply.send(result).is_err() {
            debug!("Requester of message {} is gone", message_id);
        }

        Correlation::Delivered
    }

    /// Send a typed command with the default timeout
    pub async fn execute(&self, charger_id: &str, command: ChargerCommand) -> Result<Value, CommandError> {
        self.execute_with_timeout(charger_id, command, self.default_timeout)
            .await
    }

    pub async fn execute_with_timeout(
        &self,
        charger_id: &str,
        command: ChargerCommand,
        timeout: Duration,
    ) -> Result<Value, CommandError> {
        let payload = command.payload().map_err(OcppError::JsonError)?;
        self.send_command(charger_id, command.action(), payload, timeout)
            .await
    }

    pub async fn remote_start_transaction(
        &self,
        charger_id: &str,
        id_tag: impl Into<String>,
        connector_id: Option<u32>,
        charging_profile: Option<Value>,
    ) -> Result<Value, CommandError> {
        let command = ChargerCommand::RemoteStartTransaction(RemoteStartTransactionRequest {
            connector_id,
            id_tag: id_tag.into(),
            charging_profile,
        });
        self.execute(charger_id, command).await
    }

    pub async fn remote_stop_transaction(
        &self,
        charger_id: &str,
        transaction_id: impl Into<Value>,
    ) -> Result<Value, CommandError> {
        let command = ChargerCommand::RemoteStopTransaction(RemoteStopTransactionRequest {
            transaction_id: transaction_id.into(),
        });
        self.execute(charger_id, command).await
    }

    pub async fn reset(&self, charger_id: &str, reset_type: ResetType) -> Result<Value, CommandError> {
        self.execute(charger_id, ChargerCommand::Reset(ResetRequest { reset_type }))
            .await
    }

    pub async fn unlock_connector(&self, charger_id: &str, connector_id: u32) -> Result<Value, CommandError> {
        let command = ChargerCommand::UnlockConnector(UnlockConnectorRequest { connector_id });
        self.execute(charger_id, command).await
    }

    pub async fn change_configuration(
        &self,
        charger_id: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Value, CommandError> {
        let command = ChargerCommand::ChangeConfiguration(ChangeConfigurationRequest {
            key: key.into(),
            value: value.into(),
        });
        self.execute(charger_id, command).await
    }

    pub async fn get_configuration(
        &self,
        charger_id: &str,
        keys: Option<Vec<String>>,
    ) -> Result<Value, CommandError> {
        let command = ChargerCommand::GetConfiguration(GetConfigurationRequest { key: keys });
        self.execute(charger_id, command).await
    }

    pub async fn get_diagnostics(
        &self,
        charger_id: &str,
        location: impl Into<String>,
        retries: Option<u32>,
        retry_interval: Option<u32>,
        start_time: Option<DateTime<Utc>>,
        stop_time: Option<DateTime<Utc>>,
    ) -> Result<Value, CommandError> {
        let command = ChargerCommand::GetDiagnostics(GetDiagnosticsRequest {
            location: location.into(),
            retries,
            retry_interval,
            start_time,
            stop_time,
        });
        self.execute(charger_id, command).await
    }

    pub async fn update_firmware(
        &self,
        charger_id: &str,
        location: impl Into<String>,
        retrieve_date: DateTime<Utc>,
        retries: Option<u32>,
        retry_interval: Option<u32>,
    ) -> Result<Value, CommandError> {
        let command = ChargerCommand::UpdateFirmware(UpdateFirmwareRequest {
            location: location.into(),
            retrieve_date,
            retries,
            retry_interval,
        });
        self.execute(charger_id, command).await
    }
}

/// Timer that rejects the command with `Timeout` if it is still pending
fn spawn_deadline(pending: PendingTable, message_id: String, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let expired = pending.lock().remove(&message_id);
        if let Some(cmd) = expired {
            warn!(
                "{} to {} timed out after {:?} (message {})",
                cmd.action, cmd.charger_id, timeout, message_id
            );
            let _ = cmd.reply.send(Err(CommandError::Timeout {
                charger_id: cmd.charger_id,
                action: cmd.action,
                timeout,
            }));
        }
    })
}

/// Build the error for a CALLERROR payload `{errorCode, errorDescription, errorDetails}`
fn protocol_error(payload: Value) -> CommandError {
    let code = payload
        .get("errorCode")
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or(ErrorCode::GenericError);

    let description = payload
        .get("errorDescription")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let details = payload.get("errorDetails").cloned().unwrap_or(Value::Null);

    CommandError::Protocol {
        code,
        description,
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChargerConnection, Outbound};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connected(registry: &ConnectionRegistry, id: &str) -> mpsc::Receiver<Outbound> {
        let (conn, rx) = ChargerConnection::channel(id, 16);
        registry.register(Arc::new(conn));
        rx
    }

    async fn next_call(rx: &mut mpsc::Receiver<Outbound>) -> Call {
        match rx.recv().await {
            Some(Outbound::Frame(text)) => match OcppMessage::parse(&text).unwrap() {
                OcppMessage::Call(call) => call,
                other => panic!("Expected Call, got {:?}", other),
            },
            other => panic!("Expected frame, got {:?}", other),
        }
    }

    fn dispatcher() -> (Arc<CommandDispatcher>, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        (Arc::new(CommandDispatcher::new(registry.clone())), registry)
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (dispatcher, _) = dispatcher();

        let err = dispatcher
            .send_command("CP404", Action::Reset, json!({"type": "Soft"}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::NotConnected(ref id) if id == "CP404"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_resolves_exactly_once() {
        let (dispatcher, registry) = dispatcher();
        let mut rx = connected(&registry, "CP001");

        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.reset("CP001", ResetType::Soft).await })
        };

        let call = next_call(&mut rx).await;
        assert_eq!(call.action, "Reset");
        assert_eq!(call.payload, json!({"type": "Soft"}));

        let first = dispatcher.handle_response(&call.message_id, json!({"status": "Accepted"}), false);
        let second = dispatcher.handle_response(&call.message_id, json!({"status": "Rejected"}), false);

        assert_eq!(first, Correlation::Delivered);
        assert_eq!(second, Correlation::Stale);

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, json!({"status": "Accepted"}));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_stale() {
        let (dispatcher, registry) = dispatcher();
        let mut rx = connected(&registry, "CP001");

        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .send_command("CP001", Action::Reset, json!({"type": "Hard"}), Duration::from_secs(5))
                    .await
            })
        };

        let call = next_call(&mut rx).await;
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, CommandError::Timeout { action: Action::Reset, .. }));
        assert_eq!(err.code(), "CommandTimeout");
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(
            dispatcher.handle_response(&call.message_id, json!({}), false),
            Correlation::Stale
        );
    }

    #[tokio::test]
    async fn test_call_error_rejects_with_protocol_error() {
        let (dispatcher, registry) = dispatcher();
        let mut rx = connected(&registry, "CP001");

        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.unlock_connector("CP001", 2).await })
        };

        let call = next_call(&mut rx).await;
        let error = CallError::new(call.message_id.clone(), ErrorCode::NotSupported, "no lock");
        dispatcher.handle_response(&call.message_id, error.to_payload(), true);

        match task.await.unwrap().unwrap_err() {
            CommandError::Protocol { code, description, .. } => {
                assert_eq!(code, ErrorCode::NotSupported);
                assert_eq!(description, "no lock");
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_commands_correlate_by_id() {
        let (dispatcher, registry) = dispatcher();
        let mut rx = connected(&registry, "CP001");

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.get_configuration("CP001", None).await })
        };
        let call_a = next_call(&mut rx).await;

        let second = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .change_configuration("CP001", "HeartbeatInterval", "60")
                    .await
            })
        };
        let call_b = next_call(&mut rx).await;

        assert_ne!(call_a.message_id, call_b.message_id);
        assert_eq!(dispatcher.pending_count(), 2);

        // Answer in reverse order
        dispatcher.handle_response(&call_b.message_id, json!({"status": "Accepted"}), false);
        dispatcher.handle_response(&call_a.message_id, json!({"configurationKey": []}), false);

        assert_eq!(first.await.unwrap().unwrap(), json!({"configurationKey": []}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"status": "Accepted"}));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_and_clears_pending() {
        let (dispatcher, registry) = dispatcher();
        let rx = connected(&registry, "CP001");
        drop(rx);

        let err = dispatcher
            .remote_stop_transaction("CP001", "txn_1_1")
            .await
            .unwrap_err();

        assert_eq!(err.code(), "NotConnected");
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_queue_full_reports_timeout() {
        let (dispatcher, registry) = dispatcher();
        let (conn, rx) = ChargerConnection::channel("CP001", 1);
        let conn = Arc::new(conn);
        registry.register(conn.clone());
        conn.send_text("[]".to_string()).await.unwrap();

        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .send_command("CP001", Action::Reset, json!({"type": "Soft"}), Duration::from_secs(5))
                    .await
            })
        };

        // Deadline fires while the write is still waiting for queue space
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(dispatcher.pending_count(), 0);
        drop(rx);

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "CommandTimeout");
    }

    #[test]
    fn test_message_ids_unique() {
        let (dispatcher, _) = dispatcher();
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| dispatcher.next_message_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
