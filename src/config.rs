use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Retry every upstream failure, including ones that cannot succeed on a
    /// second attempt (bad request, auth). Off by default; the transient-only
    /// classifier is the sane choice.
    #[serde(default)]
    pub retry_all_errors: bool,
    #[serde(default)]
    pub models: ModelsConfig,
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_chat_model")]
    pub chat: String,
    #[serde(default = "default_vision_model")]
    pub vision: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            chat: default_chat_model(),
            vision: default_vision_model(),
            temperature: default_temperature(),
        }
    }
}

fn default_chat_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}
fn default_vision_model() -> String {
    "meta-llama/llama-4-scout-17b-16e-instruct".to_string()
}
fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// User IDs allowed to run /stats.
    #[serde(default)]
    pub admin_ids: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Minimum spacing between two requests from the same user.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Sliding-window request cap per user over the trailing 60 seconds.
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: usize,
    /// Conversation history cap (turns, user+assistant counted separately).
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            max_per_minute: default_max_per_minute(),
            max_history_turns: default_max_history_turns(),
        }
    }
}

fn default_cooldown_seconds() -> u64 {
    3
}
fn default_max_per_minute() -> usize {
    20
}
fn default_max_history_turns() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "switchboard.db".to_string()
}

impl AppConfig {
    /// Load config.toml, then let the environment override secrets.
    /// `SWITCHBOARD_API_KEY` and `SWITCHBOARD_BOT_TOKEN` take precedence so
    /// credentials can stay out of the config file entirely.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let mut config: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("SWITCHBOARD_API_KEY") {
            if !key.is_empty() {
                self.provider.api_key = key;
            }
        }
        if let Ok(token) = std::env::var("SWITCHBOARD_BOT_TOKEN") {
            if !token.is_empty() {
                self.telegram.bot_token = token;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        if self.provider.api_key.is_empty() {
            errors.push("provider.api_key (or SWITCHBOARD_API_KEY) is required");
        }
        if self.telegram.bot_token.is_empty() {
            errors.push("telegram.bot_token (or SWITCHBOARD_BOT_TOKEN) is required");
        }
        if self.limits.max_per_minute == 0 {
            errors.push("limits.max_per_minute must be at least 1");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration errors:\n- {}", errors.join("\n- "))
        }
    }
}
