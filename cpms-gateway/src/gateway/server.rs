//! WebSocket accept loop and per-connection tasks

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{rejection_code, Admission, ProtocolGateway, OCPP_SUBPROTOCOL};
use crate::error::GatewayError;
use crate::registry::{ChargerConnection, Outbound};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

impl ProtocolGateway {
    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(
            "OCPP gateway listening on ws://{}{}/<identity>",
            listener.local_addr()?,
            self.config.path_prefix
        );
        Ok(listener)
    }

    /// Accept chargers until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), GatewayError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("TCP connection from {}", peer);

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_socket(stream, peer).await {
                    warn!("Connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }

    async fn handle_socket(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), GatewayError> {
        let mut path = String::new();
        let mut offered_ocpp = false;

        let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            offered_ocpp = req
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL))
                .unwrap_or(false);

            if offered_ocpp {
                resp.headers_mut().insert(
                    header::SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(OCPP_SUBPROTOCOL),
                );
            }
            Ok(resp)
        };

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_message_size),
            ..Default::default()
        };

        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let Admission { identity, record } = match self.authorize(&path).await {
            Ok(admission) => admission,
            Err(e) => {
                let code = rejection_code(&e);
                warn!("Rejecting {} from {}: {}", path, peer, e);
                let reason = if code == super::CLOSE_POLICY_VIOLATION {
                    "Unknown charger identity"
                } else {
                    "Identity lookup failed"
                };
                send_close(&mut ws_tx, code, reason.to_string()).await;
                return Ok(());
            }
        };

        if !offered_ocpp {
            debug!("{} did not offer the {} subprotocol", identity, OCPP_SUBPROTOCOL);
        }

        let (connection, outbound_rx) =
            ChargerConnection::channel(identity.clone(), self.config.outbound_queue);
        let connection = Arc::new(connection);

        let writer = tokio::spawn(write_outbound(
            identity.clone(),
            ws_tx,
            outbound_rx,
        ));

        self.attach(&record, connection.clone()).await;

        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    debug!("Received from {}: {}", identity, text);
                    self.handle_frame(&connection, &text).await;
                }
                Ok(Message::Binary(_)) => {
                    warn!("Ignoring binary frame from {}", identity);
                }
                Ok(Message::Close(frame)) => {
                    debug!("{} closed the socket: {:?}", identity, frame);
                    break;
                }
                // Pings are answered by tungstenite
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error on {}: {}", identity, e);
                    break;
                }
            }
        }

        self.detach(&record, &connection).await;
        writer.abort();

        Ok(())
    }
}

/// Drain a connection's outbound queue into its socket
async fn write_outbound(charger_id: String, mut ws_tx: WsSink, mut outbound_rx: mpsc::Receiver<Outbound>) {
    while let Some(item) = outbound_rx.recv().await {
        match item {
            Outbound::Frame(text) => {
                debug!("Sending to {}: {}", charger_id, text);
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    error!("Failed to write to {}: {}", charger_id, e);
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                send_close(&mut ws_tx, code, reason).await;
                break;
            }
        }
    }
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: String) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };

    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!("Close frame not delivered: {}", e);
    }
}
