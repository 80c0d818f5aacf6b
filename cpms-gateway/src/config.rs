//! Configuration for the charge point management engine
//!
//! Combines settings for the WebSocket gateway and the command intake.

use std::net::SocketAddr;
use std::time::Duration;

use cpms_core::topics;

use crate::dispatcher::DEFAULT_COMMAND_TIMEOUT;

/// Complete engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub gateway: GatewayConfig,
    pub intake: IntakeConfig,
}

/// WebSocket gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address
    pub bind_addr: SocketAddr,

    /// Path prefix; chargers connect to `<prefix>/<identity>`
    pub path_prefix: String,

    /// Heartbeat interval handed out in BootNotification replies (seconds)
    pub heartbeat_interval: u32,

    /// Validity of an accepted idTag in StartTransaction replies
    pub id_tag_expiry: Duration,

    /// Close the older socket when a charger connects twice
    pub close_superseded: bool,

    /// Publish `charger.disconnected` when a socket goes away
    pub publish_disconnect_events: bool,

    /// Outbound frames buffered per connection
    pub outbound_queue: usize,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,
}

/// Command intake configuration
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Topic carrying command requests
    pub command_topic: String,

    /// Topic receiving command responses
    pub response_topic: String,

    /// Time a charger gets to answer a command
    pub command_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            intake: IntakeConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            path_prefix: "/ocpp".to_string(),
            heartbeat_interval: 300,
            id_tag_expiry: Duration::from_secs(24 * 60 * 60),
            close_superseded: true,
            publish_disconnect_events: false,
            outbound_queue: 64,
            max_message_size: 64 * 1024,
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            command_topic: topics::COMMAND_REQUEST.to_string(),
            response_topic: topics::COMMAND_RESPONSE.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Create config listening on `bind_addr`
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            gateway: GatewayConfig {
                bind_addr,
                ..Default::default()
            },
            intake: IntakeConfig::default(),
        }
    }

    /// Set the WebSocket path prefix (leading slash added, trailing slash dropped)
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.gateway.path_prefix = normalize_prefix(&prefix.into());
        self
    }

    /// Set the BootNotification heartbeat interval
    pub fn with_heartbeat_interval(mut self, seconds: u32) -> Self {
        self.gateway.heartbeat_interval = seconds;
        self
    }

    /// Set the command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.intake.command_timeout = timeout;
        self
    }

    /// Set command request/response topics
    pub fn with_topics(mut self, command: impl Into<String>, response: impl Into<String>) -> Self {
        self.intake.command_topic = command.into();
        self.intake.response_topic = response.into();
        self
    }

    /// Keep superseded sockets open instead of closing them
    pub fn keep_superseded(mut self) -> Self {
        self.gateway.close_superseded = false;
        self
    }

    /// Publish `charger.disconnected` events
    pub fn with_disconnect_events(mut self) -> Self {
        self.gateway.publish_disconnect_events = true;
        self
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}
