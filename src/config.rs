use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    // OpenAI-compatible chat completions endpoint
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_moderation_model")]
    pub moderation_model: String,
    #[serde(default = "default_structured_retries")]
    pub structured_retries: u32,
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}

fn default_moderation_model() -> String {
    "omni-moderation-latest".to_string()
}

fn default_structured_retries() -> u32 {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_url(),
            api_key: None,
            model: default_llm_model(),
            moderation_model: default_moderation_model(),
            structured_retries: default_structured_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub llm: LlmConfig,

    // How long the coordinator waits for the client to answer a frontend
    // tool request before synthesizing an error result.
    #[serde(default = "default_tool_call_timeout_secs")]
    pub tool_call_timeout_secs: u64,

    // Debounce window for open-chat session summaries.
    #[serde(default = "default_summary_delay_mins")]
    pub summary_delay_mins: u64,

    // Delay before a finished onboarding advances the user to check-in.
    #[serde(default = "default_check_in_delay_mins")]
    pub check_in_delay_mins: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_database_path() -> String {
    "beebo.db".to_string()
}

fn default_tool_call_timeout_secs() -> u64 {
    120
}

fn default_summary_delay_mins() -> u64 {
    30
}

fn default_check_in_delay_mins() -> u64 {
    1440
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            llm: LlmConfig::default(),
            tool_call_timeout_secs: default_tool_call_timeout_secs(),
            summary_delay_mins: default_summary_delay_mins(),
            check_in_delay_mins: default_check_in_delay_mins(),
        }
    }
}

impl AppConfig {
    pub fn config_path() -> PathBuf {
        env::var("BEEBO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("beebo_config.toml"))
    }

    /// Loads the TOML config, falling back to defaults plus env overrides
    /// when no file exists.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = env::var("BEEBO_BIND") {
            self.bind_addr = addr;
        }
        if let Ok(path) = env::var("BEEBO_DATABASE_PATH") {
            self.database_path = path;
        }
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm.api_url = url;
        }
        if let Ok(key) = env::var("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(secs) = env::var("BEEBO_TOOL_CALL_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.tool_call_timeout_secs = secs;
            }
        }
        self
    }
}
