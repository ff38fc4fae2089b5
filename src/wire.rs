use crate::session::CallRequest;
use crate::transcript::TranscriptEntry;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages the browser client sends over the call websocket. The first
/// message must be `start`; after that the client streams base64 microphone
/// audio until it sends `stop` or closes the socket.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "lowercase", tag = "event")]
pub enum ClientMessage {
    Start { start: CallRequest },
    Media { media: MediaPayload },
    Stop,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MediaPayload {
    /// Base64-encoded audio bytes.
    pub payload: String,
}

/// Messages the server pushes to the client: synthesized audio to play,
/// transcript entries to display, and lifecycle markers.
#[derive(Serialize, Debug)]
#[serde(rename_all = "lowercase", tag = "event")]
pub enum ServerMessage {
    Opened {
        session_id: Uuid,
    },
    Media {
        media: MediaPayload,
    },
    Transcript {
        entry: TranscriptEntry,
    },
    Ended {
        session_id: Uuid,
        duration_secs: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallType, ContactType};

    #[test]
    fn start_message_deserializes() {
        let json = r#"{
            "event": "start",
            "start": {
                "contact_type": "student",
                "contact_id": "stu-7",
                "contact_name": "Priya Patel",
                "call_type": "telephonic_interview",
                "resume_summary": "Final year ECE, two embedded projects",
                "job_summary": null
            }
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::Start { start } = msg else {
            panic!("expected start message");
        };
        assert_eq!(start.contact_type, ContactType::Student);
        assert_eq!(start.call_type, CallType::TelephonicInterview);
        assert_eq!(start.contact_name.as_deref(), Some("Priya Patel"));
    }

    #[test]
    fn media_and_stop_messages_deserialize() {
        let media: ClientMessage =
            serde_json::from_str(r#"{"event": "media", "media": {"payload": "AAAA"}}"#).unwrap();
        assert!(matches!(
            media,
            ClientMessage::Media { media: MediaPayload { payload } } if payload == "AAAA"
        ));
        let stop: ClientMessage = serde_json::from_str(r#"{"event": "stop"}"#).unwrap();
        assert!(matches!(stop, ClientMessage::Stop));
    }

    #[test]
    fn server_messages_carry_the_event_tag() {
        let opened = serde_json::to_value(ServerMessage::Opened {
            session_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(opened["event"], "opened");

        let ended = serde_json::to_value(ServerMessage::Ended {
            session_id: Uuid::nil(),
            duration_secs: 12,
        })
        .unwrap();
        assert_eq!(ended["event"], "ended");
        assert_eq!(ended["duration_secs"], 12);
    }
}
