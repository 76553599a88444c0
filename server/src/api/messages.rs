//! Duplex channel wire protocol
//!
//! Message-typed JSON, kebab-case type tags, camelCase fields. The shapes
//! here are the contract with the browser recorder and any live viewers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Incoming client messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    StartRecording {
        session_id: String,
        user_id: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AudioChunk {
        session_id: String,
        /// Base64-encoded fragment payload
        audio_data: String,
        mime_type: String,
        #[serde(default)]
        audio_level: Option<f64>,
        #[serde(default)]
        chunk_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PauseRecording { session_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeRecording {
        session_id: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StopRecording { session_id: String },
    #[serde(rename_all = "camelCase")]
    CancelRecording { session_id: String },
    #[serde(rename_all = "camelCase")]
    JoinSession { session_id: String },
    Pong,
}

/// Outgoing server messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RecordingStarted { session_id: String },
    #[serde(rename_all = "camelCase")]
    ChunkReceived {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RecordingPaused { session_id: String },
    #[serde(rename_all = "camelCase")]
    RecordingResumed { session_id: String },
    #[serde(rename_all = "camelCase")]
    RecordingCompleted {
        session_id: String,
        transcript: String,
        summary: String,
    },
    #[serde(rename_all = "camelCase")]
    RecordingCancelled { session_id: String },
    #[serde(rename_all = "camelCase")]
    LiveTranscriptUpdate {
        session_id: String,
        new_chunk: TranscriptChunkPayload,
    },
    #[serde(rename_all = "camelCase")]
    StatusUpdate { session_id: String, status: String },
    Error { message: String },
    Ping,
}

/// Chunk payload carried by live-transcript-update
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptChunkPayload {
    pub chunk_index: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    /// Serialize to the wire form; infallible for these shapes
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"serialization failed"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_type_tags() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"start-recording","sessionId":"sess-1","userId":"user-1"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::StartRecording { ref session_id, ref user_id, mime_type: None }
                if session_id == "sess-1" && user_id == "user-1"
        ));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"audio-chunk","sessionId":"sess-1","audioData":"AAAA","mimeType":"audio/webm","audioLevel":0.3,"chunkId":"c-9"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::AudioChunk {
                session_id,
                audio_data,
                mime_type,
                audio_level,
                chunk_id,
            } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(audio_data, "AAAA");
                assert_eq!(mime_type, "audio/webm");
                assert_eq!(audio_level, Some(0.3));
                assert_eq!(chunk_id.as_deref(), Some("c-9"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"pong"}"#).unwrap(),
            ClientMessage::Pong
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"join-session","sessionId":"s"}"#)
                .unwrap(),
            ClientMessage::JoinSession { .. }
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"format-disk"}"#).is_err());
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::LiveTranscriptUpdate {
            session_id: "sess-1".to_string(),
            new_chunk: TranscriptChunkPayload {
                chunk_index: 0,
                text: "[Speaker 1]: Hello.".to_string(),
                timestamp: Utc::now(),
            },
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "live-transcript-update");
        assert_eq!(json["sessionId"], "sess-1");
        assert_eq!(json["newChunk"]["chunkIndex"], 0);
        assert_eq!(json["newChunk"]["text"], "[Speaker 1]: Hello.");
        assert!(json["newChunk"]["timestamp"].is_string());

        let msg = ServerMessage::StatusUpdate {
            session_id: "sess-1".to_string(),
            status: "paused".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "status-update");
        assert_eq!(json["status"], "paused");

        let json: serde_json::Value =
            serde_json::from_str(&ServerMessage::Ping.to_json()).unwrap();
        assert_eq!(json["type"], "ping");
    }

    #[test]
    fn test_chunk_received_omits_absent_chunk_id() {
        let msg = ServerMessage::ChunkReceived {
            session_id: "sess-1".to_string(),
            chunk_id: None,
        };
        assert!(!msg.to_json().contains("chunkId"));

        let msg = ServerMessage::ChunkReceived {
            session_id: "sess-1".to_string(),
            chunk_id: Some("c-1".to_string()),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["chunkId"], "c-1");
    }
}
