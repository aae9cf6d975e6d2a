use serde::{Deserialize, Serialize};

use crate::audio::codec::EncodedChunk;
use crate::error::Result;

/// Rate assumed for synthesized audio that declares none
pub const DEFAULT_OUTPUT_RATE: u32 = 24000;

/// First message on every session: model, voice and persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SetupMessage {
    /// Audio-only session with a prebuilt voice
    pub fn audio(
        model: impl Into<String>,
        voice: impl Into<String>,
        system_instruction: impl Into<String>,
    ) -> Self {
        Self {
            setup: Setup {
                model: model.into(),
                generation_config: GenerationConfig {
                    response_modalities: vec![Modality::Audio],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice.into(),
                            },
                        },
                    },
                },
                system_instruction: system_instruction.into(),
            },
        }
    }
}

/// One captured chunk on its way to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeInput {
    pub media: MediaBlob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    /// Base64 PCM16 LE
    pub bytes: String,
    pub sample_rate: u32,
    pub mime_type: String,
}

impl RealtimeInput {
    pub fn from_chunk(chunk: &EncodedChunk) -> Self {
        Self {
            media: MediaBlob {
                bytes: chunk.to_base64(),
                sample_rate: chunk.sample_rate,
                mime_type: chunk.mime_type(),
            },
        }
    }

    pub fn to_chunk(&self) -> Result<EncodedChunk> {
        EncodedChunk::from_base64(&self.media.bytes, self.media.sample_rate)
    }
}

/// Anything the service sends back
///
/// Exactly one field is normally present; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// Base64 PCM16 LE
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl InlineData {
    /// Declared rate, else the `rate=` parameter of the MIME type, else 24kHz
    pub fn effective_sample_rate(&self) -> u32 {
        self.sample_rate
            .filter(|&r| r > 0)
            .or_else(|| self.mime_type.as_deref().and_then(rate_from_mime))
            .unwrap_or(DEFAULT_OUTPUT_RATE)
    }

    pub fn to_chunk(&self) -> Result<EncodedChunk> {
        EncodedChunk::from_base64(&self.data, self.effective_sample_rate())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub message: String,
}

fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|&r| r > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_wire_shape() {
        let setup = SetupMessage::audio("test-model", "Zephyr", "Be brief.");

        let value = serde_json::to_value(&setup).unwrap();

        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "test-model",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": {
                                "prebuiltVoiceConfig": { "voiceName": "Zephyr" }
                            }
                        }
                    },
                    "systemInstruction": "Be brief."
                }
            })
        );
    }

    #[test]
    fn test_realtime_input_wire_shape() {
        let chunk = EncodedChunk::new(vec![0x01, 0x00, 0xff, 0x7f], 16000);

        let value = serde_json::to_value(RealtimeInput::from_chunk(&chunk)).unwrap();

        assert_eq!(value["media"]["bytes"], "AQD/fw==");
        assert_eq!(value["media"]["sampleRate"], 16000);
        assert_eq!(value["media"]["mimeType"], "audio/pcm;rate=16000");
    }

    #[test]
    fn test_server_content_parses_all_parts() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "data": "AAA=", "mimeType": "audio/pcm;rate=24000" } },
                        { "text": "hello" },
                        { "inlineData": { "data": "AAAAAA==", "sampleRate": 16000 } }
                    ]
                }
            }
        }"#;

        let message: ServerMessage = serde_json::from_str(raw).unwrap();
        let content = message.server_content.unwrap();
        let parts = content.model_turn.unwrap().parts;

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].text.as_deref(), Some("hello"));
        assert_eq!(parts[2].inline_data.as_ref().unwrap().effective_sample_rate(), 16000);
        assert!(!content.interrupted);
        assert!(!content.turn_complete);
    }

    #[test]
    fn test_flags_and_acknowledgement() {
        let interrupted: ServerMessage =
            serde_json::from_str(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert!(interrupted.server_content.unwrap().interrupted);

        let ack: ServerMessage = serde_json::from_str(r#"{"setupComplete":{}}"#).unwrap();
        assert!(ack.setup_complete.is_some());

        let error: ServerMessage =
            serde_json::from_str(r#"{"error":{"message":"quota exceeded"}}"#).unwrap();
        assert_eq!(error.error.unwrap().message, "quota exceeded");
    }

    #[test]
    fn test_rate_fallbacks() {
        let declared = InlineData {
            data: String::new(),
            sample_rate: Some(22050),
            mime_type: Some("audio/pcm;rate=16000".into()),
        };
        let from_mime = InlineData {
            sample_rate: None,
            ..declared.clone()
        };
        let bare = InlineData {
            data: String::new(),
            sample_rate: None,
            mime_type: Some("audio/pcm".into()),
        };

        assert_eq!(declared.effective_sample_rate(), 22050);
        assert_eq!(from_mime.effective_sample_rate(), 16000);
        assert_eq!(bare.effective_sample_rate(), DEFAULT_OUTPUT_RATE);
    }
}
