//! The supervisor decision engine: escalation policy and completion client.
//!
//! Given a completed user utterance, the orchestrator either lets the primary
//! model answer on its own or routes the turn through a secondary reasoning
//! pass that has tool access. The policy here is a heuristic, not a
//! classifier; both the length threshold and the keyword table are tunable
//! defaults, and the orchestrator only depends on the trait.

use crate::config::SupervisorMode;
use crate::tools::{ToolDefinition, ToolExecutor, ToolProvider};
use anyhow::{Result, anyhow};
use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Utterances at least this long are assumed to need the reasoning pass even
/// without a keyword hit.
pub const MIN_ESCALATION_CHARS: usize = 220;

/// Default tool-intent vocabulary: action verbs, resource nouns, and
/// technical nouns that tend to precede a tool call.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    // action verbs
    "open", "run", "execute", "search", "launch", "start", "create", "send", "check", "find",
    "install", "delete", "schedule", "remind", "look",
    // resource nouns
    "file", "files", "folder", "directory", "calendar", "email", "mail", "browser", "website",
    "app", "application", "document", "clipboard",
    // technical nouns
    "debug", "error", "code", "terminal", "command", "server", "database", "log", "logs",
];

/// Decides whether an utterance should be escalated to the supervisor.
pub trait EscalationPolicy: Send + Sync {
    fn should_escalate(&self, text: &str, mode: SupervisorMode) -> bool;
}

/// Length + keyword heuristic. `Always` escalates any non-empty utterance;
/// `Needed` escalates on length or a keyword hit.
pub struct KeywordHeuristic {
    min_chars: usize,
    keywords: Vec<String>,
}

impl KeywordHeuristic {
    pub fn new(min_chars: usize, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            min_chars,
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
        }
    }

    fn keyword_hit(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .any(|token| self.keywords.iter().any(|k| k == token))
    }
}

impl Default for KeywordHeuristic {
    fn default() -> Self {
        Self::new(MIN_ESCALATION_CHARS, DEFAULT_KEYWORDS.iter().copied())
    }
}

impl EscalationPolicy for KeywordHeuristic {
    fn should_escalate(&self, text: &str, mode: SupervisorMode) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        match mode {
            SupervisorMode::Always => true,
            SupervisorMode::Needed => {
                text.chars().count() >= self.min_chars || self.keyword_hit(text)
            }
        }
    }
}

/// Instruction for the direct path: the primary model answers the utterance
/// itself, with no tool access.
pub fn direct_reply_instructions(utterance: &str) -> String {
    format!("Respond naturally, in the user's language, to their last utterance: \"{utterance}\"")
}

/// Instruction for the supervisor path: the primary model speaks the
/// supervisor's answer verbatim.
pub fn verbatim_reply_instructions(answer: &str) -> String {
    format!("Say exactly the following to the user, adding nothing: \"{answer}\"")
}

/// System message pinning the reply language to the user's. The supervisor
/// exchange is always these two messages: this instruction plus the
/// utterance.
const SUPERVISOR_SYSTEM_PROMPT: &str = "You assist a live voice conversation. Answer the user's \
request concisely so the reply can be spoken aloud, and always answer in the same language the \
user spoke. Use the available tools when they help.";

/// The external reasoning service. Failures mean the affected turn is
/// dropped; they never disturb the connected session.
#[async_trait]
pub trait SupervisorClient: Send + Sync {
    /// Composes an answer to the utterance, with tool access. Returns the
    /// text the primary model should speak verbatim.
    async fn complete(&self, utterance: &str) -> Result<String>;
}

/// Chat-completions implementation of the supervisor, with a bounded
/// tool-call loop against the MCP backend.
pub struct ChatSupervisor {
    client: Client<OpenAIConfig>,
    model: String,
    tools: Arc<dyn ToolProvider>,
    executor: Arc<dyn ToolExecutor>,
    max_tool_rounds: usize,
}

impl ChatSupervisor {
    pub fn new(
        config: OpenAIConfig,
        model: impl Into<String>,
        tools: Arc<dyn ToolProvider>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
            tools,
            executor,
            max_tool_rounds: 4,
        }
    }

    async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        match self.tools.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(error = %e, "tool listing failed; supervisor proceeds without tools");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl SupervisorClient for ChatSupervisor {
    async fn complete(&self, utterance: &str) -> Result<String> {
        let definitions = self.tool_definitions().await;
        let chat_tools = definitions
            .iter()
            .map(ToolDefinition::to_chat_tool)
            .collect::<Result<Vec<_>>>()?;

        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SUPERVISOR_SYSTEM_PROMPT)
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(utterance)
                .build()?
                .into(),
        ];

        for round in 0..=self.max_tool_rounds {
            let mut request = CreateChatCompletionRequestArgs::default();
            request.model(&self.model).messages(messages.clone());
            if !chat_tools.is_empty() && round < self.max_tool_rounds {
                request.tools(chat_tools.clone()).tool_choice("auto");
            }
            let response = self.client.chat().create(request.build()?).await?;
            let choice = response
                .choices
                .first()
                .ok_or_else(|| anyhow!("supervisor response had no choices"))?;

            if let Some(tool_calls) = choice.message.tool_calls.clone().filter(|c| !c.is_empty()) {
                messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .tool_calls(tool_calls.clone())
                        .build()?
                        .into(),
                );
                for call in &tool_calls {
                    let arguments: serde_json::Value =
                        serde_json::from_str(&call.function.arguments)
                            .unwrap_or(serde_json::Value::Null);
                    let result = match self
                        .executor
                        .call_tool(&call.function.name, arguments)
                        .await
                    {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(tool = %call.function.name, error = %e, "tool call failed");
                            format!("{{\"error\": \"{e}\"}}")
                        }
                    };
                    messages.push(
                        ChatCompletionRequestToolMessageArgs::default()
                            .tool_call_id(call.id.clone())
                            .content(result)
                            .build()?
                            .into(),
                    );
                }
                debug!(round, "supervisor executed a tool round");
                continue;
            }

            if let Some(content) = &choice.message.content {
                return Ok(content.clone());
            }
            return Err(anyhow!(
                "supervisor response had neither text content nor tool calls"
            ));
        }
        Err(anyhow!("supervisor exceeded the tool-round limit"))
    }
}
