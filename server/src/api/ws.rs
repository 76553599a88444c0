//! WebSocket handler for the duplex control/data channel

use crate::api::messages::{ClientMessage, ServerMessage, TranscriptChunkPayload};
use crate::api::AppState;
use crate::events::SessionEvent;
use crate::fragments::ContainerHint;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::Engine;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main connection loop: client messages, event fan-out, liveness pings
async fn handle_ws(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.bus.subscribe();
    let mut joined: HashSet<String> = HashSet::new();
    let mut last_activity = Instant::now();

    let mut ping_interval =
        tokio::time::interval(Duration::from_secs(state.config.server.ping_interval_secs));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let liveness = Duration::from_secs(state.config.server.liveness_timeout_secs);

    info!("WebSocket connection established: {}", connection_id);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = serde_json::from_str::<ClientMessage>(&text);
                        match parsed {
                            // Pong is pure liveness; activity already noted.
                            Ok(ClientMessage::Pong) => {}
                            Ok(message) => {
                                let reply = dispatch(&state, message, &mut joined).await;
                                if let Some(reply) = reply {
                                    if send(&mut sender, &reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!("Malformed client message: {}", e);
                                let reply = ServerMessage::Error {
                                    message: format!("Malformed message: {}", e),
                                };
                                if send(&mut sender, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if joined.contains(event.session_id()) {
                            let message = event_to_message(event);
                            if send(&mut sender, &message).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Subscriber lagged, {} events skipped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() > liveness {
                    warn!("Connection {} failed liveness check, closing", connection_id);
                    break;
                }
                if send(&mut sender, &ServerMessage::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("WebSocket connection closed: {}", connection_id);
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    sender.send(Message::Text(message.to_json().into())).await
}

/// Route one client message to the registry and build the reply
async fn dispatch(
    state: &AppState,
    message: ClientMessage,
    joined: &mut HashSet<String>,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::StartRecording {
            session_id,
            user_id,
            mime_type: _,
        } => match state.registry.initialize_session(&session_id, &user_id).await {
            Ok(()) => {
                // The recording client is the first consumer of its own
                // live transcript.
                joined.insert(session_id.clone());
                Some(ServerMessage::RecordingStarted { session_id })
            }
            Err(e) => Some(error_reply(e)),
        },

        ClientMessage::AudioChunk {
            session_id,
            audio_data,
            mime_type,
            audio_level,
            chunk_id,
        } => {
            let payload = match base64::engine::general_purpose::STANDARD.decode(&audio_data) {
                Ok(payload) => payload,
                Err(e) => {
                    return Some(ServerMessage::Error {
                        message: format!("Invalid audio payload: {}", e),
                    })
                }
            };
            let hint = ContainerHint::from_mime(&mime_type);
            match state
                .registry
                .add_fragment(&session_id, payload, hint, audio_level, chunk_id.clone())
                .await
            {
                Ok(()) => Some(ServerMessage::ChunkReceived { session_id, chunk_id }),
                Err(e) => Some(error_reply(e)),
            }
        }

        ClientMessage::PauseRecording { session_id } => {
            match state.registry.pause(&session_id).await {
                Ok(()) => Some(ServerMessage::RecordingPaused { session_id }),
                Err(e) => Some(error_reply(e)),
            }
        }

        ClientMessage::ResumeRecording {
            session_id,
            mime_type: _,
        } => match state.registry.resume(&session_id).await {
            Ok(()) => Some(ServerMessage::RecordingResumed { session_id }),
            Err(e) => Some(error_reply(e)),
        },

        ClientMessage::StopRecording { session_id } => {
            match state.registry.stop(&session_id).await {
                Ok((transcript, summary)) => Some(ServerMessage::RecordingCompleted {
                    session_id,
                    transcript,
                    summary,
                }),
                Err(e) => Some(error_reply(e)),
            }
        }

        ClientMessage::CancelRecording { session_id } => {
            match state.registry.cancel(&session_id).await {
                Ok(()) => Some(ServerMessage::RecordingCancelled { session_id }),
                Err(e) => Some(error_reply(e)),
            }
        }

        ClientMessage::JoinSession { session_id } => {
            debug!("Connection joined session {}", session_id);
            joined.insert(session_id);
            None
        }

        // Handled in the connection loop before dispatch.
        ClientMessage::Pong => None,
    }
}

fn error_reply(e: crate::error::Error) -> ServerMessage {
    ServerMessage::Error {
        message: e.to_string(),
    }
}

/// Translate a bus event into its wire form
fn event_to_message(event: SessionEvent) -> ServerMessage {
    match event {
        SessionEvent::TranscriptUpdate {
            session_id,
            chunk_index,
            text,
            timestamp,
        } => ServerMessage::LiveTranscriptUpdate {
            session_id,
            new_chunk: TranscriptChunkPayload {
                chunk_index,
                text,
                timestamp,
            },
        },
        SessionEvent::Status { session_id, status } => ServerMessage::StatusUpdate {
            session_id,
            status: status.to_string(),
        },
        SessionEvent::Completed {
            session_id,
            transcript,
            summary,
        } => ServerMessage::RecordingCompleted {
            session_id,
            transcript,
            summary,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::SessionStatus;
    use chrono::Utc;

    #[test]
    fn test_event_translation() {
        let message = event_to_message(SessionEvent::TranscriptUpdate {
            session_id: "sess-1".to_string(),
            chunk_index: 2,
            text: "[Speaker 1]: Hi.".to_string(),
            timestamp: Utc::now(),
        });
        let json: serde_json::Value = serde_json::from_str(&message.to_json()).unwrap();
        assert_eq!(json["type"], "live-transcript-update");
        assert_eq!(json["newChunk"]["chunkIndex"], 2);

        let message = event_to_message(SessionEvent::Status {
            session_id: "sess-1".to_string(),
            status: SessionStatus::Processing,
        });
        let json: serde_json::Value = serde_json::from_str(&message.to_json()).unwrap();
        assert_eq!(json["type"], "status-update");
        assert_eq!(json["status"], "processing");

        let message = event_to_message(SessionEvent::Completed {
            session_id: "sess-1".to_string(),
            transcript: "t".to_string(),
            summary: "s".to_string(),
        });
        let json: serde_json::Value = serde_json::from_str(&message.to_json()).unwrap();
        assert_eq!(json["type"], "recording-completed");
        assert_eq!(json["transcript"], "t");
        assert_eq!(json["summary"], "s");
    }

    #[test]
    fn test_error_reply_carries_taxonomy_message() {
        let reply = error_reply(crate::error::Error::BufferOverflow);
        let json: serde_json::Value = serde_json::from_str(&reply.to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(
            json["message"],
            "Buffer overflow: Session exceeds maximum size"
        );
    }
}
