//! Session configuration and environment-backed API settings.

use serde::{Deserialize, Serialize};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Governs when the supervisor composes the reply instead of the primary
/// model. Only consulted while `use_supervisor` is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorMode {
    /// Every non-empty utterance goes through the supervisor.
    Always,
    /// Only utterances the escalation heuristic flags as tool-worthy.
    Needed,
}

/// The live session configuration, replaced wholesale on every update and
/// re-sent over the open control channel. Never partially mutated in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
    /// When true and `use_supervisor` is false, tool definitions are sent
    /// directly to the primary model.
    pub tools_enabled: bool,
    /// When true, tools are withheld from the primary model and only the
    /// supervisor sees them.
    pub use_supervisor: bool,
    pub supervisor_mode: SupervisorMode,
    pub silence_duration_ms: u64,
    /// `None` maps to an explicit disabled value on the wire, not an omitted
    /// field.
    pub idle_timeout_ms: Option<u64>,
    pub noise_reduction: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "verse".to_string(),
            instructions: String::new(),
            temperature: 0.8,
            tools_enabled: false,
            use_supervisor: false,
            supervisor_mode: SupervisorMode::Needed,
            silence_duration_ms: 700,
            idle_timeout_ms: None,
            noise_reduction: true,
        }
    }
}

impl SessionConfig {
    /// Whether tool definitions go to the primary model. Tools never reach
    /// both the primary model and the supervisor in the same turn: the
    /// supervisor flag always wins.
    pub fn primary_model_gets_tools(&self) -> bool {
        self.tools_enabled && !self.use_supervisor
    }
}

/// Provider endpoints and credentials, loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub api_key: String,
    /// REST base used for the ephemeral-credential exchange.
    pub rest_base_url: String,
    /// WebSocket endpoint for the realtime session itself.
    pub realtime_ws_url: String,
    /// Chat model the supervisor reasoning pass runs on.
    pub supervisor_model: String,
}

impl ApiConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "OPENAI_API_KEY".to_string(),
                "must not be empty".to_string(),
            ));
        }

        let rest_base_url = std::env::var("REALTIME_REST_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let realtime_ws_url = std::env::var("REALTIME_WS_URL")
            .unwrap_or_else(|_| "wss://api.openai.com/v1/realtime".to_string());
        let supervisor_model =
            std::env::var("SUPERVISOR_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        Ok(Self {
            api_key,
            rest_base_url,
            realtime_ws_url,
            supervisor_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("REALTIME_REST_BASE");
            env::remove_var("REALTIME_WS_URL");
            env::remove_var("SUPERVISOR_MODEL");
        }
    }

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.voice, "verse");
        assert_eq!(config.silence_duration_ms, 700);
        assert_eq!(config.idle_timeout_ms, None);
        assert_eq!(config.supervisor_mode, SupervisorMode::Needed);
        assert!(!config.use_supervisor);
    }

    #[test]
    fn tools_routing_is_mutually_exclusive() {
        let mut config = SessionConfig {
            tools_enabled: true,
            ..SessionConfig::default()
        };
        assert!(config.primary_model_gets_tools());

        // The supervisor flag always wins; the primary model loses tool access.
        config.use_supervisor = true;
        assert!(!config.primary_model_gets_tools());

        config.tools_enabled = false;
        assert!(!config.primary_model_gets_tools());
    }

    #[test]
    fn supervisor_mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SupervisorMode::Always).unwrap(),
            "\"always\""
        );
        assert_eq!(
            serde_json::to_string(&SupervisorMode::Needed).unwrap(),
            "\"needed\""
        );
    }

    #[test]
    #[serial]
    fn api_config_minimal_env() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-key");
        }

        let config = ApiConfig::from_env().expect("config should load");
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.rest_base_url, "https://api.openai.com/v1");
        assert_eq!(config.realtime_ws_url, "wss://api.openai.com/v1/realtime");
        assert_eq!(config.supervisor_model, "gpt-4o");
    }

    #[test]
    #[serial]
    fn api_config_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "custom-key");
            env::set_var("REALTIME_REST_BASE", "https://proxy.example/v1");
            env::set_var("REALTIME_WS_URL", "wss://proxy.example/v1/realtime");
            env::set_var("SUPERVISOR_MODEL", "gpt-4o-mini");
        }

        let config = ApiConfig::from_env().expect("config should load");
        assert_eq!(config.rest_base_url, "https://proxy.example/v1");
        assert_eq!(config.realtime_ws_url, "wss://proxy.example/v1/realtime");
        assert_eq!(config.supervisor_model, "gpt-4o-mini");
    }

    #[test]
    #[serial]
    fn api_config_missing_key() {
        clear_env_vars();

        let err = ApiConfig::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "OPENAI_API_KEY"),
            _ => panic!("Expected MissingVar for OPENAI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn api_config_empty_key_rejected() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "  ");
        }

        let err = ApiConfig::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "OPENAI_API_KEY"),
            _ => panic!("Expected InvalidValue for OPENAI_API_KEY"),
        }
    }
}
