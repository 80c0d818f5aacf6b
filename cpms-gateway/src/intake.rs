//! Command intake
//!
//! Turns command requests from the event bus into dispatcher calls and
//! publishes exactly one response per keyed request.

use std::sync::Arc;

use cpms_core::{BusMessage, CommandRequest, CommandResponse, EventBus, Subscription};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::IntakeConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::{CommandError, GatewayError};
use crate::ocpp::ChargerCommand;

/// Error code for a request that does not decode
pub const INVALID_REQUEST: &str = "InvalidRequest";

/// Bridges the command topic to the [`CommandDispatcher`]
#[derive(Clone)]
pub struct CommandIntake {
    config: IntakeConfig,
    dispatcher: Arc<CommandDispatcher>,
    bus: Arc<dyn EventBus>,
}

impl CommandIntake {
    pub fn new(config: IntakeConfig, dispatcher: Arc<CommandDispatcher>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            config,
            dispatcher,
            bus,
        }
    }

    /// Subscribe to the command topic
    pub async fn subscribe(&self) -> Result<Subscription, GatewayError> {
        let subscription = self.bus.subscribe(&self.config.command_topic).await?;
        info!("Command intake listening on {}", self.config.command_topic);
        Ok(subscription)
    }

    /// Process requests until the subscription ends
    pub async fn run(self, mut subscription: Subscription) {
        while let Some(message) = subscription.recv().await {
            let intake = self.clone();
            tokio::spawn(async move {
                intake.handle_message(message).await;
            });
        }

        info!("Command topic {} closed, intake stopped", subscription.topic());
    }

    /// Subscribe and run on a background task
    pub async fn spawn(self) -> Result<JoinHandle<()>, GatewayError> {
        let subscription = self.subscribe().await?;
        Ok(tokio::spawn(self.run(subscription)))
    }

    /// Handle one bus message; returns the published response, if any
    pub async fn handle_message(&self, message: BusMessage) -> Option<CommandResponse> {
        let payload = message.payload;
        let error = match CommandRequest::deserialize(&payload) {
            Ok(request) => return self.handle_request(request).await,
            Err(e) => e,
        };

        // Still answer when the request names a response key
        let Some(key) = payload.get("responseKey").and_then(Value::as_str) else {
            warn!("Dropping undecodable command request: {}", error);
            return None;
        };

        warn!("Rejecting malformed command request {}: {}", key, error);
        let request = CommandRequest::new(
            loose_field(&payload, "chargerId"),
            loose_field(&payload, "action"),
            Value::Null,
        );
        let response = CommandResponse::failure(&request, key, INVALID_REQUEST, error.to_string());
        self.publish(&response).await;

        Some(response)
    }

    /// Execute a request and publish its outcome
    pub async fn handle_request(&self, request: CommandRequest) -> Option<CommandResponse> {
        debug!(
            "Command {} for {} (key {:?})",
            request.action, request.charger_id, request.response_key
        );

        let outcome = self.execute(&request).await;

        let Some(key) = request.response_key.clone() else {
            match &outcome {
                Ok(_) => info!("{} on {} completed (no response key)", request.action, request.charger_id),
                Err(e) => warn!("{} on {} failed (no response key): {}", request.action, request.charger_id, e),
            }
            return None;
        };

        let response = match outcome {
            Ok(result) => CommandResponse::success(&request, key, result),
            Err(e) => {
                warn!("{} on {} failed: {}", request.action, request.charger_id, e);
                CommandResponse::failure(&request, key, e.code(), e.to_string())
            }
        };

        self.publish(&response).await;

        Some(response)
    }

    async fn publish(&self, response: &CommandResponse) {
        match response.to_message(&self.config.response_topic) {
            Ok(message) => {
                if let Err(e) = self.bus.publish(message).await {
                    error!("Failed to publish response {}: {}", response.response_key, e);
                }
            }
            Err(e) => error!("Failed to encode response {}: {}", response.response_key, e),
        }
    }

    async fn execute(&self, request: &CommandRequest) -> Result<Value, CommandError> {
        let command = ChargerCommand::from_parts(&request.action, request.params.clone())?;
        self.dispatcher
            .execute_with_timeout(&request.charger_id, command, self.config.command_timeout)
            .await
    }
}

/// String form of a field of an undecodable request
fn loose_field(payload: &Value, name: &str) -> String {
    match payload.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChargerConnection, ConnectionRegistry, Outbound};
    use cpms_core::{topics, MemoryBus};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        intake: CommandIntake,
        registry: Arc<ConnectionRegistry>,
        bus: Arc<MemoryBus>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(CommandDispatcher::new(registry.clone()));
        let bus = Arc::new(MemoryBus::new());
        let config = IntakeConfig {
            command_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let intake = CommandIntake::new(config, dispatcher, bus.clone());

        Fixture { intake, registry, bus }
    }

    fn connect(registry: &ConnectionRegistry, id: &str) -> mpsc::Receiver<Outbound> {
        let (conn, rx) = ChargerConnection::channel(id, 8);
        registry.register(Arc::new(conn));
        rx
    }

    #[tokio::test]
    async fn test_reset_round_trip() {
        let fx = fixture();
        let mut responses = assert_ok!(fx.bus.subscribe(topics::COMMAND_RESPONSE).await);
        let mut outbound = connect(&fx.registry, "CP001");

        let intake = fx.intake.clone();
        let task = tokio::spawn(async move {
            let request = CommandRequest::new("CP001", "Reset", json!({"type": "Soft"}))
                .with_response_key("r1");
            intake.handle_request(request).await
        });

        let call: Value = match outbound.recv().await {
            Some(Outbound::Frame(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected CALL, got {:?}", other),
        };
        assert_eq!(call[2], "Reset");
        assert_eq!(call[3], json!({"type": "Soft"}));

        let message_id = call[1].as_str().unwrap();
        fx.intake
            .dispatcher
            .handle_response(message_id, json!({"status": "Accepted"}), false);

        let returned = task.await.unwrap().unwrap();
        assert!(returned.success);

        let published = responses.recv().await.unwrap();
        assert_eq!(published.key.as_deref(), Some("r1"));
        assert_eq!(published.payload["success"], true);
        assert_eq!(published.payload["result"]["status"], "Accepted");
        assert_eq!(published.payload["chargerId"], "CP001");
        assert_eq!(published.payload["action"], "Reset");
    }

    #[tokio::test]
    async fn test_unconnected_charger_fails_without_call() {
        let fx = fixture();
        let mut responses = assert_ok!(fx.bus.subscribe(topics::COMMAND_RESPONSE).await);
        let mut other = connect(&fx.registry, "CP001");

        let request = CommandRequest::new("CP404", "Reset", json!({"type": "Hard"}))
            .with_response_key("r404");
        let response = fx.intake.handle_request(request).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("NotConnected"));
        assert!(other.try_recv().is_err());

        let published = responses.recv().await.unwrap();
        assert_eq!(published.payload["success"], false);
        assert_eq!(published.payload["error"], "NotConnected");
        assert_eq!(published.payload["chargerId"], "CP404");
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let fx = fixture();
        let _outbound = connect(&fx.registry, "CP001");

        let request = CommandRequest::new("CP001", "SelfDestruct", json!({})).with_response_key("r2");
        let response = fx.intake.handle_request(request).await.unwrap();

        assert_eq!(response.error.as_deref(), Some("UnknownCommandAction"));
        assert_eq!(response.action, "SelfDestruct");
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let fx = fixture();
        let _outbound = connect(&fx.registry, "CP001");

        let request = CommandRequest::new("CP001", "UnlockConnector", json!({"connectorId": "one"}))
            .with_response_key("r3");
        let response = fx.intake.handle_request(request).await.unwrap();

        assert_eq!(response.error.as_deref(), Some("InvalidParams"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reported() {
        let fx = fixture();
        let _outbound = connect(&fx.registry, "CP001");

        let request = CommandRequest::new("CP001", "GetConfiguration", Value::Null).with_response_key("r4");
        let response = fx.intake.handle_request(request).await.unwrap();

        assert_eq!(response.error.as_deref(), Some("CommandTimeout"));
        assert_eq!(fx.intake.dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unkeyed_request_publishes_nothing() {
        let fx = fixture();
        let mut responses = assert_ok!(fx.bus.subscribe(topics::COMMAND_RESPONSE).await);

        let request = CommandRequest::new("CP404", "Reset", json!({"type": "Soft"}));
        assert!(fx.intake.handle_request(request).await.is_none());
        assert!(responses.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_message_dropped() {
        let fx = fixture();
        let message = BusMessage::new(topics::COMMAND_REQUEST, json!({"action": 42}));
        assert!(fx.intake.handle_message(message).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_keyed_request_gets_failure() {
        let fx = fixture();
        let mut responses = assert_ok!(fx.bus.subscribe(topics::COMMAND_RESPONSE).await);

        let message = BusMessage::new(
            topics::COMMAND_REQUEST,
            json!({"chargerId": 7, "action": "Reset", "responseKey": "r1"}),
        );
        let response = fx.intake.handle_message(message).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some(INVALID_REQUEST));
        assert_eq!(response.charger_id, "7");
        assert_eq!(response.action, "Reset");

        let published = responses.recv().await.unwrap();
        assert_eq!(published.key.as_deref(), Some("r1"));
        assert_eq!(published.payload["success"], false);
        assert_eq!(published.payload["error"], "InvalidRequest");
        assert!(responses.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_run_consumes_topic() {
        let fx = fixture();
        let mut responses = assert_ok!(fx.bus.subscribe(topics::COMMAND_RESPONSE).await);
        let handle = assert_ok!(fx.intake.clone().spawn().await);

        let request = CommandRequest::new("CP404", "Reset", json!({"type": "Soft"})).with_response_key("r5");
        assert_ok!(
            fx.bus
                .publish(assert_ok!(request.to_message(topics::COMMAND_REQUEST)))
                .await
        );

        let published = responses.recv().await.unwrap();
        assert_eq!(published.key.as_deref(), Some("r5"));
        handle.abort();
        assert_err!(handle.await);
    }
}
