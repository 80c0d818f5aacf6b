//! Protocol gateway
//!
//! Owns the charger-facing side of the engine: admits connections, routes
//! inbound frames and turns charger CALLs into replies plus domain events.
//!
//! ```text
//!  charger ──ws──► server (accept, reader loop)
//!                     │ handle_frame
//!                     ├── CALL ────────► handlers ──► reply + EventBus
//!                     └── CALLRESULT/ERROR ─► CommandDispatcher
//! ```

pub mod handlers;
mod server;

use std::sync::Arc;

use chrono::Utc;
use cpms_core::events::{ChargerConnected, ChargerDisconnected};
use cpms_core::{DomainEvent, EventBus};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::dispatcher::{CommandDispatcher, Correlation};
use crate::error::GatewayError;
use crate::identity::{ChargerRecord, IdentityValidator};
use crate::ocpp::OcppMessage;
use crate::registry::{ChargerConnection, ConnectionRegistry};

use handlers::{HandlerContext, TransactionIds};

/// OCPP 1.6 JSON WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Close code for a superseded connection
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for an unknown or missing identity
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code when the identity lookup itself failed
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Charger accepted by the identity validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Identity from the request path; the registry key
    pub identity: String,
    pub record: ChargerRecord,
}

/// Charger-facing WebSocket gateway
pub struct ProtocolGateway {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    bus: Arc<dyn EventBus>,
    validator: Arc<dyn IdentityValidator>,
    transaction_ids: TransactionIds,
    id_tag_expiry: chrono::Duration,
}

impl ProtocolGateway {
    pub fn new(
        config: GatewayConfig,
        dispatcher: Arc<CommandDispatcher>,
        bus: Arc<dyn EventBus>,
        validator: Arc<dyn IdentityValidator>,
    ) -> Self {
        let id_tag_expiry = chrono::Duration::from_std(config.id_tag_expiry)
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        Self {
            registry: dispatcher.registry().clone(),
            config,
            dispatcher,
            bus,
            validator,
            transaction_ids: TransactionIds::new(),
            id_tag_expiry,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Charger identity from a request path `<prefix>/<identity>`
    pub fn identity_from_path(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(self.config.path_prefix.as_str())?;
        let identity = rest.strip_prefix('/')?.trim_end_matches('/');

        if identity.is_empty() || identity.contains('/') {
            None
        } else {
            Some(identity.to_string())
        }
    }

    /// Resolve the identity in `path` against the validator
    pub async fn authorize(&self, path: &str) -> Result<Admission, GatewayError> {
        let identity = self
            .identity_from_path(path)
            .ok_or_else(|| GatewayError::ConnectionRejected(path.to_string()))?;

        match self.validator.lookup(&identity).await? {
            Some(record) => Ok(Admission { identity, record }),
            None => Err(GatewayError::ConnectionRejected(identity)),
        }
    }

    /// Register an admitted connection and announce it.
    ///
    /// The registry key is the connection's wire identity, whatever the
    /// validator reports as `charger_code`.
    pub async fn attach(&self, record: &ChargerRecord, connection: Arc<ChargerConnection>) {
        let identity = connection.charger_id();
        let superseded = self.registry.register(connection.clone());

        if let Some(old) = superseded {
            if self.config.close_superseded {
                debug!(
                    "Closing superseded connection {} of {}",
                    old.connection_id(),
                    identity
                );
                if old.close(CLOSE_NORMAL, "superseded").await.is_err() {
                    debug!("Superseded connection of {} already gone", identity);
                }
            }
        }

        info!(
            "Charger {} connected (id {}, connection {})",
            identity,
            record.charger_id,
            connection.connection_id()
        );

        self.publish(
            identity,
            DomainEvent::ChargerConnected(ChargerConnected {
                charger_id: record.charger_id.clone(),
                charger_code: record.charger_code.clone(),
                timestamp: Utc::now(),
            }),
        )
        .await;
    }

    /// Drop a closed connection from the registry
    pub async fn detach(&self, record: &ChargerRecord, connection: &ChargerConnection) {
        let identity = connection.charger_id();
        let removed = self.registry.unregister(identity, connection);

        let uptime = Utc::now() - connection.connected_at();
        info!(
            "Charger {} disconnected (connection {}, up {}s)",
            identity,
            connection.connection_id(),
            uptime.num_seconds()
        );

        if removed && self.config.publish_disconnect_events {
            self.publish(
                identity,
                DomainEvent::ChargerDisconnected(ChargerDisconnected {
                    charger_id: record.charger_id.clone(),
                    charger_code: record.charger_code.clone(),
                    timestamp: Utc::now(),
                }),
            )
            .await;
        }
    }

    /// Route one inbound text frame
    pub async fn handle_frame(&self, connection: &ChargerConnection, text: &str) {
        let charger_id = connection.charger_id();

        let message = match OcppMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", charger_id, e);
                return;
            }
        };

        match message {
            OcppMessage::Call(call) => {
                debug!("{} -> {} ({})", charger_id, call.action, call.message_id);

                let ctx = HandlerContext {
                    charger_id,
                    now: Utc::now(),
                    heartbeat_interval: self.config.heartbeat_interval,
                    id_tag_expiry: self.id_tag_expiry,
                    transaction_ids: &self.transaction_ids,
                };
                let handled = handlers::handle_call(&ctx, &call.action, &call.payload);

                let frame = handled
                    .reply
                    .into_message(call.message_id)
                    .and_then(|reply| reply.to_text());

                match frame {
                    Ok(frame) => {
                        if connection.send_text(frame).await.is_err() {
                            warn!("Could not answer {} from {}: connection closed", call.action, charger_id);
                        }
                    }
                    Err(e) => error!("Failed to encode reply to {}: {}", call.action, e),
                }

                if let Some(event) = handled.event {
                    self.publish(charger_id, event).await;
                }
            }
            OcppMessage::CallResult(result) => {
                let outcome = self
                    .dispatcher
                    .handle_response(&result.message_id, result.payload, false);
                if outcome == Correlation::Stale {
                    debug!("Late CALLRESULT {} from {}", result.message_id, charger_id);
                }
            }
            OcppMessage::CallError(err) => {
                let outcome = self
                    .dispatcher
                    .handle_response(&err.message_id, err.to_payload(), true);
                if outcome == Correlation::Stale {
                    debug!("Late CALLERROR {} from {}", err.message_id, charger_id);
                }
            }
        }
    }

    async fn publish(&self, charger_id: &str, event: DomainEvent) {
        let message = match event.to_message(charger_id) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode {} event: {}", event.topic(), e);
                return;
            }
        };

        if let Err(e) = self.bus.publish(message).await {
            error!("Failed to publish {} for {}: {}", event.topic(), charger_id, e);
        }
    }
}

/// Close code for a rejected handshake
pub(crate) fn rejection_code(err: &GatewayError) -> u16 {
    match err {
        GatewayError::ConnectionRejected(_) => CLOSE_POLICY_VIOLATION,
        _ => CLOSE_INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IdentityError;
    use crate::identity::StaticDirectory;
    use crate::registry::Outbound;
    use async_trait::async_trait;
    use cpms_core::{topics, MemoryBus, Subscription};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct BrokenDirectory;

    #[async_trait]
    impl IdentityValidator for BrokenDirectory {
        async fn lookup(&self, _identity: &str) -> Result<Option<ChargerRecord>, IdentityError> {
            Err(IdentityError("directory unavailable".to_string()))
        }
    }

    /// Reports every identity upper-cased
    struct UppercaseDirectory;

    #[async_trait]
    impl IdentityValidator for UppercaseDirectory {
        async fn lookup(&self, identity: &str) -> Result<Option<ChargerRecord>, IdentityError> {
            Ok(Some(ChargerRecord {
                charger_id: "charger-9".to_string(),
                charger_code: identity.to_uppercase(),
            }))
        }
    }

    fn gateway_on(
        bus: Arc<MemoryBus>,
        config: GatewayConfig,
        validator: Arc<dyn IdentityValidator>,
    ) -> ProtocolGateway {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(CommandDispatcher::new(registry));
        ProtocolGateway::new(config, dispatcher, bus, validator)
    }

    fn gateway_with(config: GatewayConfig, validator: Arc<dyn IdentityValidator>) -> (ProtocolGateway, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        (gateway_on(bus.clone(), config, validator), bus)
    }

    fn gateway() -> (ProtocolGateway, Arc<MemoryBus>) {
        gateway_with(
            GatewayConfig::default(),
            Arc::new(StaticDirectory::new().with_charger("CP001", "charger-1")),
        )
    }

    fn record() -> ChargerRecord {
        ChargerRecord {
            charger_id: "charger-1".to_string(),
            charger_code: "CP001".to_string(),
        }
    }

    fn connection() -> (Arc<ChargerConnection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = ChargerConnection::channel("CP001", 16);
        (Arc::new(conn), rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.recv().await {
            Some(Outbound::Frame(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected frame, got {:?}", other),
        }
    }

    async fn subscribe(bus: &MemoryBus, topic: &str) -> Subscription {
        bus.subscribe(topic).await.unwrap()
    }

    #[test]
    fn test_identity_from_path() {
        let (gw, _) = gateway();
        assert_eq!(gw.identity_from_path("/ocpp/CP001"), Some("CP001".to_string()));
        assert_eq!(gw.identity_from_path("/ocpp/CP001/"), Some("CP001".to_string()));
        assert_eq!(gw.identity_from_path("/ocpp/"), None);
        assert_eq!(gw.identity_from_path("/ocpp"), None);
        assert_eq!(gw.identity_from_path("/other/CP001"), None);
        assert_eq!(gw.identity_from_path("/ocpp/a/b"), None);
    }

    #[tokio::test]
    async fn test_authorize() {
        let (gw, _) = gateway();
        let admission = gw.authorize("/ocpp/CP001").await.unwrap();
        assert_eq!(admission.identity, "CP001");
        assert_eq!(admission.record, record());

        let unknown = gw.authorize("/ocpp/CP404").await.unwrap_err();
        assert_eq!(rejection_code(&unknown), CLOSE_POLICY_VIOLATION);

        let (broken, _) = gateway_with(GatewayConfig::default(), Arc::new(BrokenDirectory));
        let err = broken.authorize("/ocpp/CP001").await.unwrap_err();
        assert_eq!(rejection_code(&err), CLOSE_INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_attach_publishes_connected() {
        let (gw, bus) = gateway();
        let mut events = subscribe(&bus, topics::CHARGER_CONNECTED).await;
        let (conn, _rx) = connection();

        gw.attach(&record(), conn).await;

        assert!(gw.registry().is_connected("CP001"));
        let msg = events.recv().await.unwrap();
        assert_eq!(msg.key.as_deref(), Some("CP001"));
        assert_eq!(msg.payload["chargerId"], "charger-1");
        assert_eq!(msg.payload["chargerCode"], "CP001");
    }

    #[tokio::test]
    async fn test_reconnect_closes_superseded() {
        let (gw, _bus) = gateway();
        let (first, mut first_rx) = connection();
        let (second, _second_rx) = connection();

        gw.attach(&record(), first.clone()).await;
        gw.attach(&record(), second.clone()).await;

        assert_eq!(
            first_rx.recv().await,
            Some(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "superseded".to_string()
            })
        );

        // Late teardown of the first socket leaves the second in place
        gw.detach(&record(), &first).await;
        assert_eq!(
            gw.registry().get("CP001").unwrap().connection_id(),
            second.connection_id()
        );
    }

    #[tokio::test]
    async fn test_disconnect_event_opt_in() {
        let config = GatewayConfig {
            publish_disconnect_events: true,
            ..Default::default()
        };
        let (gw, bus) = gateway_with(config, Arc::new(StaticDirectory::from_identities(["CP001"])));
        let mut events = subscribe(&bus, topics::CHARGER_DISCONNECTED).await;
        let (conn, _rx) = connection();

        gw.attach(&record(), conn.clone()).await;
        gw.detach(&record(), &conn).await;

        assert!(!gw.registry().is_connected("CP001"));
        assert_eq!(events.recv().await.unwrap().payload["chargerCode"], "CP001");
    }

    #[tokio::test]
    async fn test_no_disconnect_event_by_default() {
        let (gw, bus) = gateway();
        let mut events = subscribe(&bus, topics::CHARGER_DISCONNECTED).await;
        let (conn, _rx) = connection();

        gw.attach(&record(), conn.clone()).await;
        gw.detach(&record(), &conn).await;

        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_boot_reply_and_event() {
        let (gw, bus) = gateway();
        let mut events = subscribe(&bus, topics::CHARGER_BOOT).await;
        let (conn, mut rx) = connection();

        gw.handle_frame(&conn, r#"[2,"b1","BootNotification",{"chargePointVendor":"V","chargePointModel":"X"}]"#)
            .await;

        let reply = next_frame(&mut rx).await;
        assert_eq!(reply[0], 3);
        assert_eq!(reply[1], "b1");
        assert_eq!(reply[2]["status"], "Accepted");
        assert_eq!(reply[2]["interval"], 300);

        let msg = events.recv().await.unwrap();
        assert_eq!(msg.payload["uniqueId"], "CP001");
        assert_eq!(msg.payload["chargerInfo"]["chargePointModel"], "X");
    }

    #[tokio::test]
    async fn test_unknown_action_gets_call_error() {
        let (gw, _bus) = gateway();
        let (conn, mut rx) = connection();

        gw.handle_frame(&conn, r#"[2,"d1","DataTransfer",{"vendorId":"V"}]"#).await;

        let reply = next_frame(&mut rx).await;
        assert_eq!(reply[0], 4);
        assert_eq!(reply[1], "d1");
        assert_eq!(reply[2], "NotImplemented");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (gw, _bus) = gateway();
        let (conn, mut rx) = connection();

        gw.handle_frame(&conn, "not json").await;
        gw.handle_frame(&conn, "[9,\"x\"]").await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_result_routed_to_dispatcher() {
        let (gw, _bus) = gateway();
        let (conn, mut rx) = connection();
        gw.attach(&record(), conn.clone()).await;

        let dispatcher = gw.dispatcher().clone();
        let command = tokio::spawn(async move {
            dispatcher
                .reset("CP001", crate::ocpp::ResetType::Soft)
                .await
        });

        let call = next_frame(&mut rx).await;
        assert_eq!(call[2], "Reset");
        let reply = json!([3, call[1], {"status": "Accepted"}]).to_string();
        gw.handle_frame(&conn, &reply).await;

        let result = command.await.unwrap().unwrap();
        assert_eq!(result, json!({"status": "Accepted"}));
    }

    #[tokio::test]
    async fn test_registry_keyed_by_path_identity() {
        let (gw, bus) = gateway_with(GatewayConfig::default(), Arc::new(UppercaseDirectory));
        let mut events = subscribe(&bus, topics::CHARGER_CONNECTED).await;

        let Admission { identity, record } = gw.authorize("/ocpp/cp-lower").await.unwrap();
        assert_eq!(record.charger_code, "CP-LOWER");

        let (conn, mut rx) = ChargerConnection::channel(identity, 8);
        gw.attach(&record, Arc::new(conn)).await;

        assert!(gw.registry().is_connected("cp-lower"));
        assert!(!gw.registry().is_connected("CP-LOWER"));
        assert_eq!(events.recv().await.unwrap().payload["chargerCode"], "CP-LOWER");

        // Commands addressed by wire identity reach the socket
        let dispatcher = gw.dispatcher().clone();
        tokio::spawn(async move { dispatcher.unlock_connector("cp-lower", 1).await });
        assert_eq!(next_frame(&mut rx).await[2], "UnlockConnector");
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_siblings() {
        let bus = Arc::new(MemoryBus::with_capacity(2));
        let gw = gateway_on(
            bus.clone(),
            GatewayConfig::default(),
            Arc::new(StaticDirectory::from_identities(["CP-A", "CP-B"])),
        );
        let _stalled = subscribe(&bus, topics::STATUS_UPDATE).await;

        let (a, _rx_a) = ChargerConnection::channel("CP-A", 16);
        let (b, mut rx_b) = ChargerConnection::channel("CP-B", 16);
        let status = r#"[2,"s1","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Available"}]"#;

        gw.handle_frame(&a, status).await;
        gw.handle_frame(&a, status).await;

        let sibling = tokio::time::timeout(std::time::Duration::from_secs(1), gw.handle_frame(&b, status)).await;
        assert!(sibling.is_ok(), "sibling charger blocked by a full subscriber");
        assert_eq!(next_frame(&mut rx_b).await[0], 3);
    }
}
