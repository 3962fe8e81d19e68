//! Live API protocol types
//!
//! This module defines the JSON frames exchanged with the generative live
//! endpoint over WebSocket. Every frame is an object with exactly one
//! recognized top-level key naming the message kind.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://.../BidiGenerateContent?key=API_KEY`
//! 2. Send `{"setup": LiveConfig}` as the very first frame
//! 3. Receive `{"setupComplete": {}}`
//! 4. Stream `clientContent`, `realtimeInput` and `toolResponse` frames
//! 5. Receive `serverContent`, `toolCall` and `toolCallCancellation` frames

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::LiveError;

/// Hosted live endpoint (API key is appended as the `key` query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Model used when none is configured
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Inline blobs with this MIME prefix are treated as playable audio
pub const AUDIO_PCM_MIME_PREFIX: &str = "audio/pcm";

// ============================================================================
// Content
// ============================================================================

/// Binary payload tagged with a MIME type, base64-encoded on the wire.
///
/// Used both for inline parts and for realtime media chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64-encoded bytes
    pub data: String,
}

/// A realtime media chunk has the same shape as an inline blob.
pub type MediaChunk = Blob;

impl Blob {
    /// Encode raw bytes into a blob
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: STANDARD.encode(bytes),
        }
    }

    /// Wrap an already base64-encoded PCM16 chunk captured at `sample_rate`
    pub fn pcm16(data: String, sample_rate: u32) -> Self {
        Self {
            mime_type: format!("{};rate={}", AUDIO_PCM_MIME_PREFIX, sample_rate),
            data,
        }
    }

    /// Wrap a grabbed JPEG frame
    pub fn jpeg(bytes: &[u8]) -> Self {
        Self::from_bytes("image/jpeg", bytes)
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with(AUDIO_PCM_MIME_PREFIX)
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("image/") || self.mime_type.starts_with("video/")
    }

    /// Decode the base64 payload
    pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// Minimal content unit: inline text or an inline blob.
///
/// Part shapes this client doesn't model (executable code, function calls
/// inside a turn, ...) are kept verbatim in `Other` instead of failing the
/// whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
    Other(Map<String, Value>),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn inline(blob: Blob) -> Self {
        Part::InlineData { inline_data: blob }
    }

    /// Inline text, if this is a text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn inline_data(&self) -> Option<&Blob> {
        match self {
            Part::InlineData { inline_data } => Some(inline_data),
            _ => None,
        }
    }

    /// True for inline blobs whose MIME type starts with `audio/pcm`
    pub fn is_audio(&self) -> bool {
        self.inline_data().is_some_and(Blob::is_audio)
    }
}

/// An ordered sequence of parts attributed to a role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }
}

/// Split parts into (audio, non-audio), preserving relative order in each.
pub fn partition_parts(parts: Vec<Part>) -> (Vec<Part>, Vec<Part>) {
    parts.into_iter().partition(Part::is_audio)
}

// ============================================================================
// Session configuration
// ============================================================================

/// Response modality requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Text,
    Audio,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    pub fn prebuilt(voice_name: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.into(),
                },
            },
        }
    }
}

/// Generation parameters negotiated at setup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_modalities: Option<Vec<Modality>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// A function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Tool enabled for the session. Exactly one field is normally set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_declarations: Option<Vec<FunctionDeclaration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_search: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_execution: Option<Value>,
}

impl Tool {
    pub fn functions(declarations: Vec<FunctionDeclaration>) -> Self {
        Self {
            function_declarations: Some(declarations),
            ..Default::default()
        }
    }

    pub fn google_search() -> Self {
        Self {
            google_search: Some(Value::Object(Map::new())),
            ..Default::default()
        }
    }
}

/// Configuration carried by the `setup` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec![Modality::Audio]),
                ..Default::default()
            }),
            system_instruction: None,
            tools: Vec::new(),
        }
    }
}

// ============================================================================
// Client Messages (sent TO the server)
// ============================================================================

/// User content turn(s)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// Streamed media (microphone audio, grabbed frames)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

impl RealtimeInput {
    /// Label used in the audit log: `audio`, `video` or `audio + video`
    pub fn label(&self) -> &'static str {
        let has_audio = self.media_chunks.iter().any(Blob::is_audio);
        let has_video = self.media_chunks.iter().any(Blob::is_video);
        match (has_audio, has_video) {
            (true, true) => "audio + video",
            (false, true) => "video",
            _ => "audio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Messages sent from client to the live endpoint.
///
/// Externally tagged, so exactly one top-level key is ever written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutgoingMessage {
    Setup(LiveConfig),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl OutgoingMessage {
    /// Wrap parts as a single user-authored turn
    pub fn user_turn(parts: Vec<Part>, turn_complete: bool) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content::user(parts)],
            turn_complete,
        })
    }

    pub fn realtime_input(media_chunks: Vec<MediaChunk>) -> Self {
        Self::RealtimeInput(RealtimeInput { media_chunks })
    }

    pub fn tool_response(function_responses: Vec<FunctionResponse>) -> Self {
        Self::ToolResponse(ToolResponse { function_responses })
    }

    /// Wire key of this message
    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::Setup(_) => "setup",
            OutgoingMessage::ClientContent(_) => "clientContent",
            OutgoingMessage::RealtimeInput(_) => "realtimeInput",
            OutgoingMessage::ToolResponse(_) => "toolResponse",
        }
    }
}

/// Serialize an outgoing message to a text frame
pub fn encode(message: &OutgoingMessage) -> Result<String, LiveError> {
    serde_json::to_string(message).map_err(|e| LiveError::Encode(e.to_string()))
}

// ============================================================================
// Server Messages (received FROM the server)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupComplete {}

/// Model output for the current turn.
///
/// `modelTurn` and `turnComplete` may arrive in the same frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
}

impl ServerContent {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted == Some(true)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.turn_complete == Some(true)
    }

    /// Concatenated text of the model turn, if any
    pub fn text(&self) -> Option<String> {
        let parts = &self.model_turn.as_ref()?.parts;
        let text: String = parts.iter().filter_map(Part::as_text).collect();
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallCancellation {
    pub ids: Vec<String>,
}

/// Messages received from the live endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncomingMessage {
    SetupComplete(SetupComplete),
    ServerContent(ServerContent),
    ToolCall(ToolCall),
    ToolCallCancellation(ToolCallCancellation),
}

/// Why an inbound frame wasn't understood
#[derive(Debug, Clone, PartialEq)]
pub enum UnmatchedReason {
    /// Frame is not valid JSON
    InvalidJson(String),
    /// Frame is JSON but not an object
    NotAnObject,
    /// None of the recognized keys is present
    NoRecognizedKey,
    /// More than one recognized key is present
    Ambiguous(Vec<String>),
    /// The recognized key holds a value of the wrong shape
    InvalidShape { key: String, error: String },
}

/// An inbound frame that matched no message shape
#[derive(Debug, Clone, PartialEq)]
pub struct UnmatchedMessage {
    pub reason: UnmatchedReason,
    /// Frame text (lossy UTF-8)
    pub raw: String,
}

impl UnmatchedMessage {
    fn new(reason: UnmatchedReason, frame: &[u8]) -> Self {
        Self {
            reason,
            raw: String::from_utf8_lossy(frame).into_owned(),
        }
    }
}

impl fmt::Display for UnmatchedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            UnmatchedReason::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            UnmatchedReason::NotAnObject => write!(f, "frame is not a JSON object"),
            UnmatchedReason::NoRecognizedKey => write!(f, "no recognized message key"),
            UnmatchedReason::Ambiguous(keys) => {
                write!(f, "ambiguous message keys: {}", keys.join(", "))
            }
            UnmatchedReason::InvalidShape { key, error } => {
                write!(f, "malformed `{}` message: {}", key, error)
            }
        }
    }
}

const SETUP_COMPLETE: &str = "setupComplete";
const SERVER_CONTENT: &str = "serverContent";
const TOOL_CALL: &str = "toolCall";
const TOOL_CALL_CANCELLATION: &str = "toolCallCancellation";

const RECOGNIZED_KEYS: [&str; 4] = [
    SETUP_COMPLETE,
    SERVER_CONTENT,
    TOOL_CALL,
    TOOL_CALL_CANCELLATION,
];

/// Decode an inbound frame (text or binary, both carry JSON).
///
/// Never panics: anything that isn't exactly one recognized message shape
/// comes back as `Err(UnmatchedMessage)`.
pub fn decode(frame: &[u8]) -> Result<IncomingMessage, UnmatchedMessage> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|e| UnmatchedMessage::new(UnmatchedReason::InvalidJson(e.to_string()), frame))?;

    let Value::Object(mut object) = value else {
        return Err(UnmatchedMessage::new(UnmatchedReason::NotAnObject, frame));
    };

    let present: Vec<&str> = RECOGNIZED_KEYS
        .iter()
        .copied()
        .filter(|key| object.contains_key(*key))
        .collect();

    let key = match present.as_slice() {
        [key] => *key,
        [] => return Err(UnmatchedMessage::new(UnmatchedReason::NoRecognizedKey, frame)),
        _ => {
            let keys = present.iter().map(|k| k.to_string()).collect();
            return Err(UnmatchedMessage::new(UnmatchedReason::Ambiguous(keys), frame));
        }
    };

    let body = object.remove(key).unwrap_or(Value::Null);
    let parsed = match key {
        SETUP_COMPLETE => serde_json::from_value(body).map(IncomingMessage::SetupComplete),
        SERVER_CONTENT => serde_json::from_value(body).map(IncomingMessage::ServerContent),
        TOOL_CALL => serde_json::from_value(body).map(IncomingMessage::ToolCall),
        _ => serde_json::from_value(body).map(IncomingMessage::ToolCallCancellation),
    };

    parsed.map_err(|e| {
        UnmatchedMessage::new(
            UnmatchedReason::InvalidShape {
                key: key.to_string(),
                error: e.to_string(),
            },
            frame,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_value(message: &OutgoingMessage) -> Value {
        serde_json::from_str(&encode(message).unwrap()).unwrap()
    }

    #[test]
    fn test_setup_serialization() {
        let config = LiveConfig {
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec![Modality::Audio]),
                speech_config: Some(SpeechConfig::prebuilt("Aoede")),
                ..Default::default()
            }),
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::text("be brief")],
            }),
            ..Default::default()
        };

        let value = to_value(&OutgoingMessage::Setup(config));

        assert_eq!(value["setup"]["model"], DEFAULT_MODEL);
        assert_eq!(
            value["setup"]["generationConfig"]["responseModalities"],
            json!(["AUDIO"])
        );
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert_eq!(
            value["setup"]["systemInstruction"],
            json!({"parts": [{"text": "be brief"}]})
        );
        assert!(value["setup"].get("tools").is_none());
        assert_eq!(value.as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_client_content_serialization() {
        let msg = OutgoingMessage::user_turn(vec![Part::text("hello")], true);

        assert_eq!(
            to_value(&msg),
            json!({
                "clientContent": {
                    "turns": [{"role": "user", "parts": [{"text": "hello"}]}],
                    "turnComplete": true
                }
            })
        );
        assert_eq!(msg.kind(), "clientContent");
    }

    #[test]
    fn test_realtime_input_serialization() {
        let msg = OutgoingMessage::realtime_input(vec![Blob::pcm16("AAAA".to_string(), 16000)]);

        assert_eq!(
            to_value(&msg),
            json!({
                "realtimeInput": {
                    "mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "AAAA"}]
                }
            })
        );
    }

    #[test]
    fn test_tool_response_serialization() {
        let msg = OutgoingMessage::tool_response(vec![FunctionResponse {
            id: "call-1".to_string(),
            name: None,
            response: json!({"output": {"success": true}}),
        }]);

        assert_eq!(
            to_value(&msg),
            json!({
                "toolResponse": {
                    "functionResponses": [
                        {"id": "call-1", "response": {"output": {"success": true}}}
                    ]
                }
            })
        );
    }

    #[test]
    fn test_tools_serialization() {
        let config = LiveConfig {
            tools: vec![
                Tool::google_search(),
                Tool::functions(vec![FunctionDeclaration {
                    name: "render_altair".to_string(),
                    description: Some("Displays an altair graph".to_string()),
                    parameters: Some(json!({"type": "OBJECT"})),
                }]),
            ],
            ..Default::default()
        };

        let value = to_value(&OutgoingMessage::Setup(config));

        assert_eq!(value["setup"]["tools"][0], json!({"googleSearch": {}}));
        assert_eq!(
            value["setup"]["tools"][1]["functionDeclarations"][0]["name"],
            "render_altair"
        );
    }

    #[test]
    fn test_realtime_input_label() {
        let audio = Blob::pcm16(String::new(), 16000);
        let video = Blob::jpeg(&[0xff, 0xd8]);

        let input = RealtimeInput {
            media_chunks: vec![audio.clone()],
        };
        assert_eq!(input.label(), "audio");

        let input = RealtimeInput {
            media_chunks: vec![video.clone()],
        };
        assert_eq!(input.label(), "video");

        let input = RealtimeInput {
            media_chunks: vec![audio, video],
        };
        assert_eq!(input.label(), "audio + video");
    }

    #[test]
    fn test_decode_setup_complete() {
        let msg = decode(br#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(msg, IncomingMessage::SetupComplete(SetupComplete {}));
    }

    #[test]
    fn test_decode_tool_call() {
        let json = br#"{
            "toolCall": {
                "functionCalls": [
                    {"id": "abc", "name": "render_altair", "args": {"json_graph": "{}"}}
                ]
            }
        }"#;

        match decode(json).unwrap() {
            IncomingMessage::ToolCall(call) => {
                assert_eq!(call.function_calls.len(), 1);
                assert_eq!(call.function_calls[0].id, "abc");
                assert_eq!(call.function_calls[0].name, "render_altair");
                assert_eq!(call.function_calls[0].args["json_graph"], "{}");
            }
            other => panic!("Expected ToolCall, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_tool_call_cancellation() {
        let msg = decode(br#"{"toolCallCancellation": {"ids": ["a", "b"]}}"#).unwrap();
        assert_eq!(
            msg,
            IncomingMessage::ToolCallCancellation(ToolCallCancellation {
                ids: vec!["a".to_string(), "b".to_string()]
            })
        );
    }

    #[test]
    fn test_decode_server_content_variants() {
        match decode(br#"{"serverContent": {"interrupted": true}}"#).unwrap() {
            IncomingMessage::ServerContent(content) => assert!(content.is_interrupted()),
            other => panic!("Expected ServerContent, got {:?}", other),
        }

        match decode(br#"{"serverContent": {"turnComplete": true}}"#).unwrap() {
            IncomingMessage::ServerContent(content) => {
                assert!(content.is_turn_complete());
                assert!(content.model_turn.is_none());
            }
            other => panic!("Expected ServerContent, got {:?}", other),
        }

        let json = br#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"text": "Hello"},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAE="}},
                        {"executableCode": {"language": "PYTHON", "code": "print(1)"}}
                    ]
                }
            }
        }"#;
        match decode(json).unwrap() {
            IncomingMessage::ServerContent(content) => {
                let parts = &content.model_turn.as_ref().unwrap().parts;
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0].as_text(), Some("Hello"));
                assert!(parts[1].is_audio());
                assert!(matches!(parts[2], Part::Other(_)));
                assert_eq!(content.text(), Some("Hello".to_string()));
            }
            other => panic!("Expected ServerContent, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_ignores_unrecognized_sibling_keys() {
        let json = br#"{"serverContent": {"turnComplete": true}, "usageMetadata": {"totalTokenCount": 5}}"#;
        assert!(matches!(
            decode(json),
            Ok(IncomingMessage::ServerContent(_))
        ));
    }

    #[test]
    fn test_decode_malformed_json_never_panics() {
        let inputs: [&[u8]; 8] = [
            b"",
            b"{",
            b"not json",
            b"{\"setupComplete\": }",
            b"\xff\xfe\x00",
            b"[1, 2",
            b"{\"serverContent\": {\"modelTurn\": ",
            b"nul",
        ];

        for input in inputs {
            let result = decode(input);
            assert!(
                matches!(
                    result,
                    Err(UnmatchedMessage {
                        reason: UnmatchedReason::InvalidJson(_),
                        ..
                    })
                ),
                "expected InvalidJson for {:?}, got {:?}",
                input,
                result
            );
        }
    }

    #[test]
    fn test_decode_non_object() {
        let err = decode(b"[1, 2, 3]").unwrap_err();
        assert_eq!(err.reason, UnmatchedReason::NotAnObject);

        let err = decode(b"42").unwrap_err();
        assert_eq!(err.reason, UnmatchedReason::NotAnObject);
    }

    #[test]
    fn test_decode_no_recognized_key() {
        let err = decode(br#"{"goAway": {"timeLeft": "10s"}}"#).unwrap_err();
        assert_eq!(err.reason, UnmatchedReason::NoRecognizedKey);
        assert!(err.raw.contains("goAway"));
    }

    #[test]
    fn test_decode_ambiguous_keys() {
        let err = decode(br#"{"setupComplete": {}, "toolCall": {"functionCalls": []}}"#)
            .unwrap_err();
        assert_eq!(
            err.reason,
            UnmatchedReason::Ambiguous(vec!["setupComplete".to_string(), "toolCall".to_string()])
        );
    }

    #[test]
    fn test_decode_invalid_shape() {
        let err = decode(br#"{"toolCall": "nope"}"#).unwrap_err();
        match &err.reason {
            UnmatchedReason::InvalidShape { key, .. } => assert_eq!(key, "toolCall"),
            other => panic!("Expected InvalidShape, got {:?}", other),
        }
        assert!(err.to_string().contains("toolCall"));
    }

    fn audio(tag: &str) -> Part {
        Part::inline(Blob {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: tag.to_string(),
        })
    }

    #[test]
    fn test_partition_preserves_order_and_count() {
        let image = Part::inline(Blob::jpeg(&[1, 2, 3]));
        let cases = vec![
            vec![],
            vec![audio("a1")],
            vec![Part::text("t1")],
            vec![audio("a1"), Part::text("t1"), audio("a2"), image.clone(), Part::text("t2")],
            vec![Part::text("t1"), Part::text("t2"), audio("a1"), audio("a2"), audio("a3")],
        ];

        for parts in cases {
            let total = parts.len();
            let expected_audio: Vec<Part> = parts.iter().filter(|p| p.is_audio()).cloned().collect();
            let expected_other: Vec<Part> = parts.iter().filter(|p| !p.is_audio()).cloned().collect();

            let (audio_parts, other_parts) = partition_parts(parts);

            assert_eq!(audio_parts.len() + other_parts.len(), total);
            assert_eq!(audio_parts, expected_audio);
            assert_eq!(other_parts, expected_other);
        }
    }

    #[test]
    fn test_non_pcm_audio_is_not_audio_part() {
        let part = Part::inline(Blob::from_bytes("audio/mp3", &[0, 1]));
        assert!(!part.is_audio());
    }

    #[test]
    fn test_blob_round_trips_bytes() {
        let blob = Blob::from_bytes("audio/pcm", &[0x00, 0x01, 0xff]);
        assert_eq!(blob.decode_data().unwrap(), vec![0x00, 0x01, 0xff]);
    }
}
