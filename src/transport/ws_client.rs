//! # WebSocket Backend
//!
//! `LiveBackend` implementation over a single WebSocket connection.
//!
//! ## Connection Lifecycle:
//! 1. Open the socket and send the setup frame
//! 2. Wait for `setupComplete` (bounded by the connect timeout); a close or error first
//!    fails `connect`
//! 3. Split the socket: a writer task drains the session's outbound queue in order, a
//!    reader task parses frames into `ServerMessage`s
//! 4. A close from either side ends both tasks; the reader reports `Closed` or `Error`

use crate::error::VoiceError;
use crate::transport::wire::{parse_server_frame, realtime_input_json, setup_frame, ParsedFrame};
use crate::transport::{LiveBackend, LiveConnectConfig, LiveConnection, LiveSession, Outbound, ServerMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Live backend reached at a `ws://` (or, with the `tls` feature, `wss://`) URL.
pub struct WebSocketBackend {
    endpoint: String,
    connect_timeout: Duration,
    inbound_capacity: usize,
}

impl WebSocketBackend {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration, inbound_capacity: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
            inbound_capacity: inbound_capacity.max(1),
        }
    }

    async fn open(&self, model_id: &str, config: &LiveConnectConfig) -> Result<LiveConnection, VoiceError> {
        let (socket, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| VoiceError::Transport(format!("connect to {} failed: {}", self.endpoint, e)))?;
        let (mut sink, mut source) = socket.split();

        let setup = serde_json::to_string(&setup_frame(model_id, config))
            .map_err(|e| VoiceError::Transport(format!("cannot encode setup: {}", e)))?;
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| VoiceError::Transport(format!("cannot send setup: {}", e)))?;

        wait_for_setup(&mut source).await?;
        info!("Live session ready on {} (model {})", self.endpoint, model_id);

        let (session, outbound) = LiveSession::channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_capacity);

        tokio::spawn(write_loop(sink, outbound));
        tokio::spawn(read_loop(source, inbound_tx, session.clone()));

        Ok(LiveConnection {
            session,
            inbound: inbound_rx,
        })
    }
}

#[async_trait]
impl LiveBackend for WebSocketBackend {
    async fn connect(&self, model_id: &str, config: &LiveConnectConfig) -> Result<LiveConnection, VoiceError> {
        tokio::time::timeout(self.connect_timeout, self.open(model_id, config))
            .await
            .map_err(|_| {
                VoiceError::Transport(format!(
                    "backend did not become ready within {}s",
                    self.connect_timeout.as_secs_f64()
                ))
            })?
    }
}

/// What a raw WebSocket message carries for us.
enum Incoming {
    Json(String),
    Closed(Option<String>),
    Skip,
}

fn classify(message: Message) -> Incoming {
    match message {
        Message::Text(text) => Incoming::Json(text.as_str().to_owned()),
        // Some deployments send JSON in binary frames
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Incoming::Json(text),
            Err(_) => {
                warn!("Dropping non-UTF-8 binary frame ({} bytes)", bytes.len());
                Incoming::Skip
            }
        },
        Message::Close(frame) => Incoming::Closed(frame.map(|f| f.reason.to_string())),
        _ => Incoming::Skip,
    }
}

async fn wait_for_setup(source: &mut WsSource) -> Result<(), VoiceError> {
    while let Some(message) = source.next().await {
        let message = message.map_err(|e| VoiceError::Transport(format!("socket error during setup: {}", e)))?;
        match classify(message) {
            Incoming::Json(text) => match parse_server_frame(&text) {
                Ok(ParsedFrame::SetupComplete) => return Ok(()),
                Ok(_) => debug!("Ignoring frame received before setupComplete"),
                Err(e) => warn!("Unparseable frame during setup: {}", e),
            },
            Incoming::Closed(reason) => {
                return Err(VoiceError::Transport(format!(
                    "backend closed during setup: {}",
                    reason.unwrap_or_default()
                )))
            }
            Incoming::Skip => {}
        }
    }
    Err(VoiceError::Transport("backend hung up during setup".to_string()))
}

async fn write_loop(mut sink: WsSink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Media(chunk) => {
                let json = match realtime_input_json(&chunk) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Cannot encode media chunk: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!("Send to backend failed: {}", e);
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
    debug!("Backend writer finished");
}

async fn read_loop(mut source: WsSource, inbound: mpsc::Sender<ServerMessage>, session: LiveSession) {
    let last = loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break ServerMessage::Error(e.to_string()),
            None => break ServerMessage::Closed,
        };

        match classify(message) {
            Incoming::Json(text) => match parse_server_frame(&text) {
                Ok(ParsedFrame::Messages(messages)) => {
                    for message in messages {
                        if inbound.send(message).await.is_err() {
                            debug!("Session consumer gone, stopping reader");
                            session.mark_closed();
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unparseable backend frame: {}", e),
            },
            Incoming::Closed(reason) => {
                debug!("Backend closed the session: {:?}", reason);
                break ServerMessage::Closed;
            }
            Incoming::Skip => {}
        }
    };

    session.mark_closed();
    let _ = inbound.send(last).await;
    debug!("Backend reader finished");
}
