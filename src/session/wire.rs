//! Control message wire format
//!
//! JSON control messages share the connection with binary PCM16 frames.
//! Both directions are closed tagged-variant types; inbound tags nobody
//! recognizes decode to [`ServerMessage::Unknown`] and are dropped with a
//! logged warning rather than failing the session.

use serde::{Deserialize, Serialize};

use crate::audio::{CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE};
use crate::{Error, Result};

/// Wire tag for the canonical audio encoding
pub const FORMAT_PCM16: &str = "pcm16";

/// Control messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Declare the canonical format and open a streamed utterance
    #[serde(rename = "audio.start", rename_all = "camelCase")]
    AudioStart {
        project_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar_id: Option<String>,
        format: String,
        sample_rate: u32,
        channels: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    /// Close the streamed utterance and hand it to recognition
    #[serde(rename = "audio.stop")]
    AudioStop,

    /// Abandon the streamed utterance without recognition
    #[serde(rename = "audio.cancel")]
    AudioCancel,
}

impl ClientMessage {
    /// Build an `audio.start` declaring the canonical format
    #[must_use]
    pub fn audio_start(
        project_id: String,
        avatar_id: Option<String>,
        language: Option<String>,
    ) -> Self {
        Self::AudioStart {
            project_id,
            avatar_id,
            format: FORMAT_PCM16.to_string(),
            sample_rate: CANONICAL_SAMPLE_RATE,
            channels: CANONICAL_CHANNELS,
            language,
        }
    }

    /// Serialize for the text side of the connection
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }
}

/// Control messages received from the remote engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Utterance stream acknowledged
    #[serde(rename = "audio.started")]
    AudioStarted,

    /// Cancellation acknowledged
    #[serde(rename = "audio.cancelled")]
    AudioCancelled,

    /// Recognition began
    #[serde(rename = "asr.start")]
    AsrStart,

    /// Final transcript for the utterance
    #[serde(rename = "asr.final")]
    AsrFinal { text: String },

    /// Incremental reply text, append-only
    #[serde(rename = "assistant.delta")]
    AssistantDelta { text: String },

    /// Reply text is complete
    #[serde(rename = "assistant.done", rename_all = "camelCase")]
    AssistantDone {
        #[serde(default)]
        text: Option<String>,
    },

    /// Synthesis audio about to begin
    #[serde(rename = "tts.start", rename_all = "camelCase")]
    TtsStart {
        #[serde(default)]
        voice_id: Option<String>,
        #[serde(default)]
        format: Option<String>,
    },

    /// Synthesis skipped by the remote side
    #[serde(rename = "tts.skipped")]
    TtsSkipped {
        #[serde(default)]
        reason: Option<String>,
    },

    /// One decodable audio chunk, base64 of canonical PCM16
    #[serde(rename = "tts.audio", rename_all = "camelCase")]
    TtsAudio {
        data: String,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        sample_rate: Option<u32>,
    },

    /// Current mouth-shape intensity
    #[serde(rename = "viseme", rename_all = "camelCase")]
    Viseme {
        value: f32,
        #[serde(default)]
        at_ms: Option<u64>,
    },

    /// Synthesis finished; session returns to idle
    #[serde(rename = "tts.done")]
    TtsDone,

    /// Reportable error description from the remote side
    #[serde(rename = "error")]
    Error { message: String },

    /// Any tag this client does not recognize; ignored with a warning
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Decode one inbound text message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for undecodable payloads (missing
    /// discriminant, wrong field types); the caller drops the message.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Protocol(format!("undecodable control message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_start_uses_wire_field_names() {
        let msg = ClientMessage::audio_start("p1".to_string(), Some("a7".to_string()), None);
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "audio.start");
        assert_eq!(json["projectId"], "p1");
        assert_eq!(json["avatarId"], "a7");
        assert_eq!(json["format"], "pcm16");
        assert_eq!(json["sampleRate"], 16_000);
        assert_eq!(json["channels"], 1);
        assert!(json.get("language").is_none());
    }

    #[test]
    fn audio_start_omits_absent_avatar() {
        let msg = ClientMessage::audio_start("p1".to_string(), None, Some("en".to_string()));
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert!(json.get("avatarId").is_none());
        assert_eq!(json["language"], "en");
    }

    #[test]
    fn stop_and_cancel_are_bare_tags() {
        assert_eq!(ClientMessage::AudioStop.encode().unwrap(), r#"{"type":"audio.stop"}"#);
        assert_eq!(
            ClientMessage::AudioCancel.encode().unwrap(),
            r#"{"type":"audio.cancel"}"#
        );
    }

    #[test]
    fn inbound_messages_decode_by_tag() {
        assert_eq!(
            ServerMessage::decode(r#"{"type":"asr.final","text":"hello"}"#).unwrap(),
            ServerMessage::AsrFinal {
                text: "hello".to_string()
            }
        );
        assert_eq!(
            ServerMessage::decode(r#"{"type":"assistant.delta","text":"hi"}"#).unwrap(),
            ServerMessage::AssistantDelta {
                text: "hi".to_string()
            }
        );
        assert_eq!(
            ServerMessage::decode(r#"{"type":"tts.done"}"#).unwrap(),
            ServerMessage::TtsDone
        );
        assert_eq!(
            ServerMessage::decode(r#"{"type":"viseme","value":0.4,"atMs":120}"#).unwrap(),
            ServerMessage::Viseme {
                value: 0.4,
                at_ms: Some(120)
            }
        );
    }

    #[test]
    fn tts_audio_decodes_optional_fields() {
        let msg = ServerMessage::decode(
            r#"{"type":"tts.audio","data":"AAAA","format":"pcm_16000","sampleRate":16000}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::TtsAudio {
                data: "AAAA".to_string(),
                format: Some("pcm_16000".to_string()),
                sample_rate: Some(16_000),
            }
        );
    }

    #[test]
    fn unknown_tag_falls_back_without_error() {
        assert_eq!(
            ServerMessage::decode(r#"{"type":"mystery.event","payload":1}"#).unwrap(),
            ServerMessage::Unknown
        );
    }

    #[test]
    fn missing_discriminant_is_a_protocol_error() {
        assert!(matches!(
            ServerMessage::decode(r#"{"text":"hello"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            ServerMessage::decode("not json"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn wrong_field_type_is_a_protocol_error() {
        assert!(matches!(
            ServerMessage::decode(r#"{"type":"asr.final","text":7}"#),
            Err(Error::Protocol(_))
        ));
    }
}
