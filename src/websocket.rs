//! # Session Event Feed
//!
//! Pushes coaching-session events to UI clients over WebSocket at `/ws/events`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: The server immediately sends a `snapshot` (state + transcript so far)
//! 2. **Events**: `state_changed` and `transcript_entry` follow as they happen
//! 3. **Commands**: Clients may send `start_session` / `end_session`
//! 4. **Heartbeat**: JSON `ping` every 30 s; no sign of life for 60 s closes the socket
//!
//! ## Message Format:
//! All messages are JSON objects tagged by `type`:
//! ```json
//! {"type": "state_changed", "state": "connected", "reason": null, "session_id": "..."}
//! {"type": "transcript_entry", "id": 3, "speaker": "model", "text": "Nice pacing!"}
//! ```

use crate::coach::{CoachEvent, ConnectionState, ConnectionStateMachine};
use crate::error::AppError;
use crate::state::AppState;
use crate::transcript::TranscriptEntry;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket message types for client-server communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    /// Full picture, sent on connect and after the feed fell behind
    #[serde(rename = "snapshot")]
    Snapshot {
        state: ConnectionState,
        session_id: Option<Uuid>,
        last_error: Option<String>,
        transcript: Vec<TranscriptEntry>,
    },

    #[serde(rename = "state_changed")]
    StateChanged {
        state: ConnectionState,
        reason: Option<String>,
        session_id: Option<Uuid>,
    },

    #[serde(rename = "transcript_entry")]
    TranscriptEntry(TranscriptEntry),

    /// Client asks to open a coaching session
    #[serde(rename = "start_session")]
    StartSession,

    /// Client asks to end the coaching session
    #[serde(rename = "end_session")]
    EndSession,

    #[serde(rename = "error")]
    Error {
        /// Machine-readable error type
        code: String,
        message: String,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

impl From<CoachEvent> for FeedMessage {
    fn from(event: CoachEvent) -> Self {
        match event {
            CoachEvent::StateChanged {
                state,
                reason,
                session_id,
            } => FeedMessage::StateChanged {
                state,
                reason,
                session_id,
            },
            CoachEvent::TranscriptEntry(entry) => FeedMessage::TranscriptEntry(entry),
        }
    }
}

/// Send pre-serialized JSON to the client (used from spawned tasks).
#[derive(Message)]
#[rtype(result = "()")]
pub struct SendText(pub String);

/// WebSocket actor for one UI client.
pub struct EventFeedSocket {
    coach: ConnectionStateMachine,
    last_heartbeat: Instant,
}

impl EventFeedSocket {
    pub fn new(coach: ConnectionStateMachine) -> Self {
        Self {
            coach,
            last_heartbeat: Instant::now(),
        }
    }

    fn snapshot_message(&self) -> FeedMessage {
        let snapshot = self.coach.snapshot();
        FeedMessage::Snapshot {
            state: snapshot.state,
            session_id: snapshot.session_id,
            last_error: snapshot.last_error,
            transcript: self.coach.transcript(),
        }
    }

    /// Subscribe, then take the snapshot. Anything that happens after the snapshot is
    /// already queued on the returned receiver.
    fn open_feed(&self) -> (broadcast::Receiver<CoachEvent>, FeedMessage) {
        let events = self.coach.subscribe();
        (events, self.snapshot_message())
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &FeedMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Cannot serialize feed message: {}", e),
        }
    }

    fn send_error(ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!("WebSocket error {}: {}", code, message);
        Self::send(
            ctx,
            &FeedMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Run `start()` off the actor; the outcome arrives through the event stream, failures
    /// are also reported to this client.
    fn handle_start(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let coach = self.coach.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            if let Err(err) = coach.start().await {
                let app_error = AppError::from(err);
                let code = app_error.status_code();
                let message = FeedMessage::Error {
                    code: format!("session_error_{}", code.as_u16()),
                    message: app_error.to_string(),
                };
                if let Ok(json) = serde_json::to_string(&message) {
                    addr.do_send(SendText(json));
                }
            }
        });
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl Actor for EventFeedSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Event feed connection started");

        let (events, snapshot) = self.open_feed();
        Self::send(ctx, &snapshot);
        ctx.add_stream(BroadcastStream::new(events));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                Self::send(ctx, &FeedMessage::Ping { timestamp: now_millis() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // The session outlives its viewers; closing the feed does not stop it
        info!("Event feed connection stopped");
    }
}

/// Coaching events from the state machine.
impl StreamHandler<Result<CoachEvent, BroadcastStreamRecvError>> for EventFeedSocket {
    fn handle(&mut self, item: Result<CoachEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(event) => Self::send(ctx, &FeedMessage::from(event)),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("Event feed fell behind by {} events, resending snapshot", missed);
                let snapshot = self.snapshot_message();
                Self::send(ctx, &snapshot);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Coach event stream ended");
        ctx.stop();
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for EventFeedSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<FeedMessage>(&text) {
                    Ok(FeedMessage::StartSession) => self.handle_start(ctx),
                    Ok(FeedMessage::EndSession) => {
                        // The resulting state_changed reaches every client through the stream
                        self.coach.stop();
                    }
                    Ok(FeedMessage::Ping { timestamp }) => Self::send(ctx, &FeedMessage::Pong { timestamp }),
                    Ok(FeedMessage::Pong { .. }) => {}
                    Ok(_) => {
                        warn!("Received unexpected message type from client");
                    }
                    Err(err) => {
                        Self::send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                Self::send_error(ctx, "unsupported", "Binary frames are not accepted on the event feed");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for EventFeedSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// WebSocket endpoint handler: upgrades the request and hands it to an `EventFeedSocket`.
pub async fn event_feed(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New event feed connection from: {:?}", req.connection_info().peer_addr());
    ws::start(EventFeedSocket::new(app_state.coach.clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use crate::transcript::Speaker;

    #[test]
    fn test_event_serialization() {
        let message = FeedMessage::from(CoachEvent::TranscriptEntry(TranscriptEntry {
            id: 7,
            speaker: Speaker::Model,
            text: "Nice pacing!".to_string(),
        }));

        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "transcript_entry");
        assert_eq!(json["speaker"], "model");
        assert_eq!(json["id"], 7);

        let state = serde_json::to_value(FeedMessage::from(CoachEvent::StateChanged {
            state: ConnectionState::Error,
            reason: Some("quota exceeded".to_string()),
            session_id: None,
        }))
        .unwrap();
        assert_eq!(state["type"], "state_changed");
        assert_eq!(state["state"], "error");
        assert_eq!(state["reason"], "quota exceeded");
    }

    #[test]
    fn test_client_commands_parse() {
        let start: FeedMessage = serde_json::from_str(r#"{"type":"start_session"}"#).unwrap();
        assert_eq!(start, FeedMessage::StartSession);
        let end: FeedMessage = serde_json::from_str(r#"{"type":"end_session"}"#).unwrap();
        assert_eq!(end, FeedMessage::EndSession);
        let ping: FeedMessage = serde_json::from_str(r#"{"type":"ping","timestamp":5}"#).unwrap();
        assert_eq!(ping, FeedMessage::Ping { timestamp: 5 });
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(serde_json::from_str::<FeedMessage>(r#"{"type":"audio_data"}"#).is_err());
    }

    #[tokio::test]
    async fn test_feed_sees_changes_right_after_snapshot() {
        let coach = test_state().coach;
        let socket = EventFeedSocket::new(coach.clone());

        let (mut events, snapshot) = socket.open_feed();
        assert!(matches!(
            snapshot,
            FeedMessage::Snapshot { state: ConnectionState::Idle, .. }
        ));

        coach.start().await.unwrap();
        let first = events.try_recv().unwrap();
        assert!(matches!(
            first,
            CoachEvent::StateChanged { state: ConnectionState::Connecting, .. }
        ));
        coach.stop();
    }
}
