//! Builds the engine from command-line arguments and configuration.

use anyhow::{Context, Result, anyhow};

use helm_config::HelmConfig;
use helm_context::SummarizingCompressor;
use helm_engine::{Engine, GenerationParams, Provider};
use helm_providers::AnyAdapter;
use helm_providers::claude::ClaudeAdapter;
use helm_providers::deepseek::DeepSeekAdapter;
use helm_providers::local::LocalAdapter;

use crate::args::Args;

pub type HelmEngine = Engine<AnyAdapter, SummarizingCompressor<AnyAdapter>>;

/// Provider and generation parameters for this session.
///
/// Command-line flags win over the config file. A model configured for a
/// different provider than the one selected on the command line is ignored.
pub fn resolve(args: &Args, config: &HelmConfig) -> Result<(Provider, GenerationParams)> {
    let configured = config.provider()?;
    let provider = args
        .provider
        .or_else(|| args.model.as_deref().and_then(Provider::from_model_name))
        .or(configured)
        .unwrap_or_default();

    let config_model_applies = configured.is_none_or(|p| p == provider);
    let model = args
        .model
        .as_deref()
        .or_else(|| config.model().filter(|_| config_model_applies))
        .unwrap_or(provider.default_model());

    Ok((provider, config.generation_params(provider, Some(model))))
}

pub fn build_adapter(config: &HelmConfig, provider: Provider, model: &str) -> Result<AnyAdapter> {
    let key = config.api_key(provider);
    let adapter = match provider {
        Provider::Claude => {
            let key = key.ok_or_else(|| missing_key(provider))?;
            AnyAdapter::from(ClaudeAdapter::new(key, model)?)
        }
        Provider::DeepSeek => {
            let key = key.ok_or_else(|| missing_key(provider))?;
            AnyAdapter::from(DeepSeekAdapter::new(key, model)?)
        }
        Provider::Local => AnyAdapter::from(
            LocalAdapter::new(config.local_base_url(), key, model)?
                .with_include_usage(config.local_include_usage()),
        ),
    };
    Ok(adapter)
}

fn missing_key(provider: Provider) -> anyhow::Error {
    anyhow!(
        "no API key for {}: set {} or add it under [api_keys] in the config file",
        provider.display_name(),
        provider.env_var()
    )
}

pub fn build_engine(config: &HelmConfig, provider: Provider, model: &str) -> Result<HelmEngine> {
    let context = config.context_config()?;
    let policy = config.retry_policy();
    let idle_timeout = config.idle_timeout();

    let adapter = build_adapter(config, provider, model)
        .with_context(|| format!("failed to set up {provider}"))?;
    // Separate instance so a summarization never supersedes a turn in flight.
    let summarizer = build_adapter(config, provider, model)?;
    let compressor = SummarizingCompressor::new(summarizer)
        .with_retry_policy(policy.clone())
        .with_idle_timeout(idle_timeout);

    tracing::info!(
        %provider,
        model,
        auto_compact = context.compression.auto_compact,
        idle_timeout_secs = idle_timeout.as_secs(),
        "Engine configured"
    );

    Ok(Engine::new(adapter, context)
        .with_compressor(compressor)
        .with_retry_policy(policy)
        .with_idle_timeout(idle_timeout))
}

#[cfg(test)]
mod tests {
    use super::{build_adapter, resolve};
    use crate::args::Args;
    use helm_config::HelmConfig;
    use helm_engine::{Provider, ProviderAdapter};

    fn config(toml_str: &str) -> HelmConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn defaults_to_claude() {
        let (provider, params) = resolve(&Args::default(), &HelmConfig::default()).unwrap();
        assert_eq!(provider, Provider::Claude);
        assert_eq!(params.model, Provider::Claude.default_model());
    }

    #[test]
    fn config_selects_provider_and_model() {
        let config = config("[app]\nprovider = \"deepseek\"\nmodel = \"deepseek-reasoner\"\n");
        let (provider, params) = resolve(&Args::default(), &config).unwrap();
        assert_eq!(provider, Provider::DeepSeek);
        assert_eq!(params.model, "deepseek-reasoner");
    }

    #[test]
    fn flag_provider_ignores_foreign_config_model() {
        let config = config("[app]\nprovider = \"deepseek\"\nmodel = \"deepseek-reasoner\"\n");
        let args = Args {
            provider: Some(Provider::Local),
            ..Args::default()
        };
        let (provider, params) = resolve(&args, &config).unwrap();
        assert_eq!(provider, Provider::Local);
        assert_eq!(params.model, Provider::Local.default_model());
    }

    #[test]
    fn flag_model_infers_provider() {
        let args = Args {
            model: Some("deepseek-chat".to_string()),
            ..Args::default()
        };
        let (provider, params) = resolve(&args, &HelmConfig::default()).unwrap();
        assert_eq!(provider, Provider::DeepSeek);
        assert_eq!(params.model, "deepseek-chat");
    }

    #[test]
    fn local_adapter_needs_no_key() {
        let config = config("[local]\nbase_url = \"http://127.0.0.1:9/v1\"\n");
        let adapter = build_adapter(&config, Provider::Local, "tiny").unwrap();
        assert_eq!(adapter.provider(), Provider::Local);
        assert_eq!(adapter.model(), "tiny");
    }
}
