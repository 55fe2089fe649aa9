//! Configuration loading for Helm.
//!
//! ```toml
//! [app]
//! provider = "deepseek"
//! model = "deepseek-reasoner"
//! max_tokens = 8192
//!
//! [api_keys]
//! deepseek = "${DEEPSEEK_API_KEY}"
//!
//! [local]
//! base_url = "http://127.0.0.1:8080/v1"
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 250
//!
//! [stream]
//! idle_timeout_secs = 90
//!
//! [context]
//! max_context_tokens = 120000
//! auto_compact = true
//! trigger = "percentage"
//! threshold = 75
//! ```
//!
//! Every section is optional. Missing values fall back to the defaults of
//! the crate that owns them.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

use helm_context::{CompressionConfig, CompressionTrigger, ContextConfig};
use helm_providers::DEFAULT_STREAM_IDLE_TIMEOUT_SECS;
use helm_providers::retry::RetryPolicy;
use helm_types::{ApiKey, GenerationParams, Provider};

/// Overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "HELM_CONFIG";
/// Overrides the stream inactivity window, in seconds.
pub const IDLE_TIMEOUT_ENV: &str = "HELM_STREAM_IDLE_TIMEOUT_SECS";

const fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct HelmConfig {
    pub app: Option<AppConfig>,
    pub api_keys: Option<ApiKeys>,
    pub local: Option<LocalConfig>,
    pub retry: Option<RetryConfig>,
    pub stream: Option<StreamConfig>,
    pub context: Option<ContextSection>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    /// "claude", "deepseek", or "local".
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

#[derive(Default, Deserialize)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub deepseek: Option<String>,
    pub local: Option<String>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mask(opt: Option<&String>) -> &'static str {
            if opt.is_some() { "[REDACTED]" } else { "None" }
        }
        f.debug_struct("ApiKeys")
            .field("anthropic", &mask(self.anthropic.as_ref()))
            .field("deepseek", &mask(self.deepseek.as_ref()))
            .field("local", &mask(self.local.as_ref()))
            .finish()
    }
}

impl ApiKeys {
    fn get(&self, provider: Provider) -> Option<&String> {
        match provider {
            Provider::Claude => self.anthropic.as_ref(),
            Provider::DeepSeek => self.deepseek.as_ref(),
            Provider::Local => self.local.as_ref(),
        }
    }
}

/// Locally hosted OpenAI-compatible server.
#[derive(Debug, Deserialize)]
pub struct LocalConfig {
    pub base_url: Option<String>,
    /// Request a trailing usage chunk. Some servers reject the option.
    #[serde(default = "default_true")]
    pub include_usage: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            include_usage: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    /// Hard timeout per attempt. `0` disables it.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamConfig {
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextSection {
    pub max_context_tokens: Option<u32>,
    pub system_prompt_tokens: Option<u32>,
    pub keep_first: Option<bool>,
    #[serde(default)]
    pub auto_compact: bool,
    /// "percentage", "tokens", or "messages".
    pub trigger: Option<String>,
    pub threshold: Option<f64>,
    pub keep_recent: Option<usize>,
}

impl ContextSection {
    fn trigger(&self) -> Result<CompressionTrigger, ConfigError> {
        let method = self.trigger.as_deref().unwrap_or("percentage");
        let threshold = self.threshold;
        if let Some(value) = threshold
            && (!value.is_finite() || value < 0.0)
        {
            return Err(ConfigError::Invalid {
                field: "context.threshold",
                message: format!("{value} is not a non-negative number"),
            });
        }
        match method.to_ascii_lowercase().as_str() {
            "percentage" => Ok(CompressionTrigger::Percentage {
                threshold: threshold.map_or(80.0, |v| v.min(100.0) as f32),
            }),
            "tokens" => Ok(CompressionTrigger::Tokens {
                threshold: threshold.map_or(150_000, |v| v as u32),
            }),
            "messages" => Ok(CompressionTrigger::Messages {
                threshold: threshold.map_or(50, |v| v as usize),
            }),
            other => Err(ConfigError::Invalid {
                field: "context.trigger",
                message: format!("unknown trigger {other:?}"),
            }),
        }
    }
}

/// Replace `${VAR}` references with environment values. Unknown variables
/// expand to the empty string; an unclosed `${` is kept verbatim.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find("${") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[pos..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parse an idle-window override. Zero and garbage are ignored.
fn parse_idle_override(raw: Option<&str>) -> Option<Duration> {
    let raw = raw?.trim();
    match raw.parse::<u64>() {
        Ok(0) | Err(_) => {
            tracing::warn!(value = raw, "Ignoring invalid {IDLE_TIMEOUT_ENV}");
            None
        }
        Ok(secs) => Some(Duration::from_secs(secs)),
    }
}

impl HelmConfig {
    /// Load from [`config_path`]. A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Configured provider. Falls back to inferring from the model name.
    pub fn provider(&self) -> Result<Option<Provider>, ConfigError> {
        let app = self.app.as_ref();
        if let Some(name) = app.and_then(|a| a.provider.as_deref()) {
            return Provider::parse(name)
                .map(Some)
                .ok_or_else(|| ConfigError::Invalid {
                    field: "app.provider",
                    message: format!("unknown provider {name:?}"),
                });
        }
        Ok(app
            .and_then(|a| a.model.as_deref())
            .and_then(Provider::from_model_name))
    }

    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.app
            .as_ref()
            .and_then(|a| a.model.as_deref())
            .filter(|m| !m.trim().is_empty())
    }

    /// Key for `provider`: config file first (with `${VAR}` expansion), then
    /// the provider's environment variable.
    #[must_use]
    pub fn api_key(&self, provider: Provider) -> Option<ApiKey> {
        let configured = self
            .api_keys
            .as_ref()
            .and_then(|keys| keys.get(provider))
            .map(|raw| expand_env_vars(raw))
            .filter(|key| !key.trim().is_empty());
        let key = configured.or_else(|| {
            env::var(provider.env_var())
                .ok()
                .filter(|key| !key.trim().is_empty())
        })?;
        Some(ApiKey::new(provider, key))
    }

    #[must_use]
    pub fn generation_params(&self, provider: Provider, model_override: Option<&str>) -> GenerationParams {
        let model = model_override
            .or_else(|| self.model())
            .unwrap_or(provider.default_model());
        let mut params = GenerationParams::new(model);
        if let Some(app) = &self.app {
            if let Some(max_tokens) = app.max_tokens {
                params = params.with_max_tokens(max_tokens);
            }
            if let Some(temperature) = app.temperature {
                params = params.with_temperature(temperature);
            }
            if let Some(prompt) = app.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
                params = params.with_system_prompt(prompt);
            }
        }
        params
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        let Some(retry) = &self.retry else {
            return policy;
        };
        if let Some(attempts) = retry.max_attempts {
            policy = policy.with_max_attempts(attempts);
        }
        if let Some(ms) = retry.initial_delay_ms {
            policy = policy.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = retry.max_delay_ms {
            policy = policy.with_max_delay(Duration::from_millis(ms));
        }
        if let Some(multiplier) = retry.backoff_multiplier {
            policy = policy.with_backoff_multiplier(multiplier);
        }
        if let Some(secs) = retry.timeout_secs {
            policy = policy.with_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        policy
    }

    /// Inactivity window: environment override, then config, then default.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout_with(env::var(IDLE_TIMEOUT_ENV).ok().as_deref())
    }

    fn idle_timeout_with(&self, env_override: Option<&str>) -> Duration {
        parse_idle_override(env_override)
            .or_else(|| {
                self.stream
                    .as_ref()
                    .and_then(|s| s.idle_timeout_secs)
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
            })
            .unwrap_or(Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS))
    }

    pub fn context_config(&self) -> Result<ContextConfig, ConfigError> {
        let mut config = ContextConfig::default();
        let Some(section) = &self.context else {
            return Ok(config);
        };
        if let Some(max) = section.max_context_tokens {
            config.max_context_tokens = max;
        }
        if let Some(reserved) = section.system_prompt_tokens {
            config.system_prompt_tokens = reserved;
        }
        if let Some(keep_first) = section.keep_first {
            config.keep_first = keep_first;
        }
        let defaults = CompressionConfig::default();
        config.compression = CompressionConfig {
            auto_compact: section.auto_compact,
            trigger: section.trigger()?,
            keep_recent: section.keep_recent.unwrap_or(defaults.keep_recent),
        };
        Ok(config)
    }

    #[must_use]
    pub fn local_base_url(&self) -> Option<&str> {
        self.local
            .as_ref()
            .and_then(|l| l.base_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }

    #[must_use]
    pub fn local_include_usage(&self) -> bool {
        self.local.as_ref().is_none_or(|l| l.include_usage)
    }
}

/// `$HELM_CONFIG`, else `~/.helm/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".helm").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::{ApiKeys, ConfigError, HelmConfig, expand_env_vars, parse_idle_override};
    use helm_context::CompressionTrigger;
    use helm_types::Provider;
    use std::io::Write;
    use std::time::Duration;

    fn parse(toml_str: &str) -> HelmConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            std::env::set_var("HELM_TEST_CONFIG_VAR", "replaced");
        }
        let result = expand_env_vars("prefix ${HELM_TEST_CONFIG_VAR} suffix");
        assert_eq!(result, "prefix replaced suffix");
        unsafe {
            std::env::remove_var("HELM_TEST_CONFIG_VAR");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            std::env::remove_var("HELM_MISSING_VAR_FOR_TEST");
        }
        let result = expand_env_vars("before ${HELM_MISSING_VAR_FOR_TEST} after");
        assert_eq!(result, "before  after");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_var_name_dropped() {
        assert_eq!(expand_env_vars("test ${} more"), "test  more");
    }

    #[test]
    fn expand_env_vars_unicode_content() {
        unsafe {
            std::env::set_var("HELM_UNICODE_VAR", "🦀");
        }
        let result = expand_env_vars("Hello ${HELM_UNICODE_VAR} Rust ✓");
        assert_eq!(result, "Hello 🦀 Rust ✓");
        unsafe {
            std::env::remove_var("HELM_UNICODE_VAR");
        }
    }

    #[test]
    fn parse_empty_config() {
        let config = parse("");
        assert!(config.app.is_none());
        assert!(config.api_keys.is_none());
        assert_eq!(config.provider().unwrap(), None);
        assert!(config.local_include_usage());
    }

    #[test]
    fn parse_app_config() {
        let config = parse(
            r#"
[app]
provider = "deepseek"
model = "deepseek-reasoner"
max_tokens = 4096
temperature = 0.3
system_prompt = "Be terse."
"#,
        );
        assert_eq!(config.provider().unwrap(), Some(Provider::DeepSeek));
        let params = config.generation_params(Provider::DeepSeek, None);
        assert_eq!(params.model, "deepseek-reasoner");
        assert_eq!(params.max_tokens, 4096);
        assert_eq!(params.temperature, Some(0.3));
        assert_eq!(params.system_prompt.as_deref(), Some("Be terse."));

        let params = config.generation_params(Provider::DeepSeek, Some("deepseek-chat"));
        assert_eq!(params.model, "deepseek-chat");
    }

    #[test]
    fn provider_inferred_from_model() {
        let config = parse("[app]\nmodel = \"claude-opus-4-1\"\n");
        assert_eq!(config.provider().unwrap(), Some(Provider::Claude));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = parse("[app]\nprovider = \"gpt\"\n");
        assert!(matches!(
            config.provider(),
            Err(ConfigError::Invalid {
                field: "app.provider",
                ..
            })
        ));
    }

    #[test]
    fn api_keys_debug_redacts_values() {
        let keys = ApiKeys {
            anthropic: Some("sk-ant-secret123".to_string()),
            deepseek: Some("sk-secret456".to_string()),
            local: None,
        };
        let debug_output = format!("{keys:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("None"));
        assert!(!debug_output.contains("sk-ant-secret123"));
        assert!(!debug_output.contains("sk-secret456"));
    }

    #[test]
    fn api_key_from_config_expands_env() {
        unsafe {
            std::env::set_var("HELM_TEST_DEEPSEEK_KEY", "sk-from-env");
        }
        let config = parse("[api_keys]\ndeepseek = \"${HELM_TEST_DEEPSEEK_KEY}\"\n");
        let key = config.api_key(Provider::DeepSeek).unwrap();
        assert_eq!(key.as_str(), "sk-from-env");
        assert_eq!(key.provider(), Provider::DeepSeek);
        unsafe {
            std::env::remove_var("HELM_TEST_DEEPSEEK_KEY");
        }
    }

    #[test]
    fn retry_policy_overrides() {
        let config = parse(
            r"
[retry]
max_attempts = 5
initial_delay_ms = 250
max_delay_ms = 4000
backoff_multiplier = 3.0
timeout_secs = 0
",
        );
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(4));
        assert!((policy.backoff_multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(policy.timeout, None);
    }

    #[test]
    fn idle_timeout_precedence() {
        let config = parse("[stream]\nidle_timeout_secs = 90\n");
        assert_eq!(config.idle_timeout_with(None), Duration::from_secs(90));
        assert_eq!(config.idle_timeout_with(Some("15")), Duration::from_secs(15));
        assert_eq!(config.idle_timeout_with(Some("zero")), Duration::from_secs(90));
        assert_eq!(
            parse("").idle_timeout_with(Some("0")),
            Duration::from_secs(60)
        );
        assert_eq!(parse_idle_override(Some(" 30 ")), Some(Duration::from_secs(30)));
    }

    #[test]
    fn context_defaults_without_section() {
        let context = parse("").context_config().unwrap();
        assert_eq!(context.max_context_tokens, 180_000);
        assert_eq!(context.system_prompt_tokens, 2_000);
        assert!(context.keep_first);
        assert!(!context.compression.auto_compact);
    }

    #[test]
    fn context_section_builds_trigger() {
        let config = parse(
            r#"
[context]
max_context_tokens = 120000
keep_first = false
auto_compact = true
trigger = "tokens"
threshold = 100000
keep_recent = 4
"#,
        );
        let context = config.context_config().unwrap();
        assert_eq!(context.max_context_tokens, 120_000);
        assert!(!context.keep_first);
        assert!(context.compression.auto_compact);
        assert_eq!(context.compression.keep_recent, 4);
        assert_eq!(
            context.compression.trigger,
            CompressionTrigger::Tokens { threshold: 100_000 }
        );
    }

    #[test]
    fn invalid_trigger_is_rejected() {
        let config = parse("[context]\ntrigger = \"vibes\"\n");
        assert!(config.context_config().is_err());
        let config = parse("[context]\nthreshold = -1.0\n");
        assert!(config.context_config().is_err());
    }

    #[test]
    fn parse_local_config() {
        let config = parse("[local]\nbase_url = \"http://127.0.0.1:8080/v1\"\ninclude_usage = false\n");
        assert_eq!(config.local_base_url(), Some("http://127.0.0.1:8080/v1"));
        assert!(!config.local_include_usage());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[app]\nprovider = \"local\"\nmodel = \"qwen2.5-coder\"").unwrap();
        let config = HelmConfig::load_from(file.path()).unwrap();
        assert_eq!(config.provider().unwrap(), Some(Provider::Local));
        assert_eq!(config.model(), Some("qwen2.5-coder"));
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "invalid toml [").unwrap();
        match HelmConfig::load_from(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn load_from_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HelmConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }
}
