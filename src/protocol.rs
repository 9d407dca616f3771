//! The control-channel wire protocol.
//!
//! Pure translation between `SessionConfig`/internal intents and outbound
//! JSON frames, and between inbound JSON frames and typed `ControlEvent`s.
//! Decoding is best-effort: malformed or unrecognized payloads yield `None`
//! and are dropped by the caller, never raised as errors.

use crate::config::SessionConfig;
use crate::tools::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound protocol messages the orchestrator reacts to. Every other message
/// type on the wire decodes to `None` and is ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// Rate-limit telemetry; replaces the last-known snapshot wholesale.
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated { rate_limits: Vec<RateLimit> },
    /// Acknowledgement echoing the configuration the service applied.
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Value },
    /// A conversation item was created. Fires for assistant items too; the
    /// router only acts on `role == "user"`.
    #[serde(rename = "conversation.item.created")]
    ItemCreated { item: ConversationItem },
    /// Input-audio transcription finished for an earlier user item.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted { item_id: String, transcript: String },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RateLimit {
    pub name: String,
    #[serde(default)]
    pub remaining: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub reset_seconds: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConversationItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Vec<ItemContent>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ItemContent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
}

impl ConversationItem {
    /// First usable text carried inline on the item, if any. Audio items
    /// usually arrive with a null transcript that is filled in later by a
    /// transcription-completed event.
    pub fn inline_text(&self) -> Option<&str> {
        self.content
            .iter()
            .filter_map(|part| {
                part.text
                    .as_deref()
                    .or(part.transcript.as_deref())
                    .filter(|s| !s.trim().is_empty())
            })
            .next()
    }
}

/// Best-effort parse of one inbound frame.
pub fn decode(raw: &str) -> Option<ControlEvent> {
    serde_json::from_str(raw).ok()
}

// --- Outbound frames ---

#[derive(Serialize)]
struct SessionUpdateFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    session: SessionResource<'a>,
}

#[derive(Serialize)]
struct SessionResource<'a> {
    model: &'a str,
    voice: &'a str,
    instructions: &'a str,
    temperature: f32,
    modalities: [&'static str; 2],
    input_audio_format: &'static str,
    output_audio_format: &'static str,
    input_audio_transcription: Value,
    turn_detection: TurnDetection,
    input_audio_noise_reduction: Value,
    tools: Vec<Value>,
    tool_choice: &'static str,
}

#[derive(Serialize)]
struct TurnDetection {
    #[serde(rename = "type")]
    kind: &'static str,
    silence_duration_ms: u64,
    // Serialized even when None: the wire contract wants an explicit
    // disabled value, not an omitted field.
    idle_timeout_ms: Option<u64>,
    create_response: bool,
    interrupt_response: bool,
}

/// Encodes the outbound `session.update` frame.
///
/// Tool definitions reach the primary model only when tools are enabled and
/// the supervisor is off; otherwise the encoded list is empty regardless of
/// what the caller passes. When the supervisor owns the replies, the server's
/// turn detection stops auto-creating responses.
pub fn encode_session_update(config: &SessionConfig, tools: &[ToolDefinition]) -> String {
    let tools = if config.primary_model_gets_tools() {
        tools.iter().map(ToolDefinition::to_realtime_value).collect()
    } else {
        Vec::new()
    };

    let frame = SessionUpdateFrame {
        kind: "session.update",
        session: SessionResource {
            model: &config.model,
            voice: &config.voice,
            instructions: &config.instructions,
            temperature: config.temperature,
            modalities: ["text", "audio"],
            input_audio_format: "pcm16",
            output_audio_format: "pcm16",
            input_audio_transcription: serde_json::json!({ "model": "whisper-1" }),
            turn_detection: TurnDetection {
                kind: "server_vad",
                silence_duration_ms: config.silence_duration_ms,
                idle_timeout_ms: config.idle_timeout_ms,
                create_response: !config.use_supervisor,
                interrupt_response: true,
            },
            input_audio_noise_reduction: if config.noise_reduction {
                serde_json::json!({ "type": "near_field" })
            } else {
                Value::Null
            },
            tools,
            tool_choice: "auto",
        },
    };
    serde_json::to_string(&frame).expect("session.update frame serializes")
}

#[derive(Serialize)]
struct ResponseCreateFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    response: ResponseSpec<'a>,
}

#[derive(Serialize)]
struct ResponseSpec<'a> {
    modalities: [&'static str; 2],
    instructions: &'a str,
}

/// Encodes a one-shot `response.create` frame carrying a lone instruction.
/// Used both for direct replies and for injecting supervisor-authored text.
pub fn encode_response_create(instructions: &str) -> String {
    let frame = ResponseCreateFrame {
        kind: "response.create",
        response: ResponseSpec {
            modalities: ["text", "audio"],
            instructions,
        },
    };
    serde_json::to_string(&frame).expect("response.create frame serializes")
}

#[derive(Serialize)]
struct AudioAppendFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    audio: &'a str,
}

/// Encodes one captured audio frame (already base64 PCM16) for the input
/// buffer.
pub fn encode_audio_append(audio_b64: &str) -> String {
    let frame = AudioAppendFrame {
        kind: "input_audio_buffer.append",
        audio: audio_b64,
    };
    serde_json::to_string(&frame).expect("audio append frame serializes")
}
