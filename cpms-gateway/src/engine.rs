//! Engine wiring
//!
//! Builds the registry, dispatcher, gateway and intake around a shared event
//! bus and identity validator, and runs them together.

use std::net::SocketAddr;
use std::sync::Arc;

use cpms_core::EventBus;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::EngineConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::GatewayError;
use crate::gateway::ProtocolGateway;
use crate::identity::IdentityValidator;
use crate::intake::CommandIntake;
use crate::registry::ConnectionRegistry;

/// Charge point management engine
pub struct Engine {
    gateway: Arc<ProtocolGateway>,
    intake: CommandIntake,
}

impl Engine {
    pub fn new(config: EngineConfig, bus: Arc<dyn EventBus>, validator: Arc<dyn IdentityValidator>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(
            CommandDispatcher::new(registry).with_timeout(config.intake.command_timeout),
        );

        let gateway = Arc::new(ProtocolGateway::new(
            config.gateway,
            dispatcher.clone(),
            bus.clone(),
            validator,
        ));
        let intake = CommandIntake::new(config.intake, dispatcher, bus);

        Self { gateway, intake }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.gateway.registry()
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        self.gateway.dispatcher()
    }

    /// Bind, subscribe and start serving in the background
    pub async fn start(self) -> Result<RunningEngine, GatewayError> {
        let listener = self.gateway.bind().await?;
        let local_addr = listener.local_addr()?;

        let intake = self.intake.spawn().await?;
        let server = tokio::spawn(self.gateway.clone().serve(listener));

        info!("Engine started on {}", local_addr);

        Ok(RunningEngine {
            local_addr,
            gateway: self.gateway,
            server,
            intake,
        })
    }

    /// Start and block until the server stops
    pub async fn run(self) -> Result<(), GatewayError> {
        self.start().await?.wait().await
    }
}

/// Handle to a started [`Engine`]
pub struct RunningEngine {
    local_addr: SocketAddr,
    gateway: Arc<ProtocolGateway>,
    server: JoinHandle<Result<(), GatewayError>>,
    intake: JoinHandle<()>,
}

impl RunningEngine {
    /// Address the WebSocket server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.gateway.registry()
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        self.gateway.dispatcher()
    }

    /// Wait for the server loop to end
    pub async fn wait(self) -> Result<(), GatewayError> {
        let result = self.server.await?;
        self.intake.abort();
        result
    }

    /// Stop accepting connections and commands
    pub fn shutdown(self) {
        self.server.abort();
        self.intake.abort();
        info!("Engine on {} stopped", self.local_addr);
    }
}
