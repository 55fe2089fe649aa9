//! Command-line parsing.

use clap::Parser;

use helm_engine::Provider;

#[derive(Debug, Default, Clone, PartialEq, Parser)]
#[command(name = "helm", version)]
#[command(about = "Sends PROMPT and prints the reply. Without a prompt, starts an interactive session.")]
pub struct Args {
    /// claude, deepseek, or local
    #[arg(short, long, value_name = "NAME", value_parser = parse_provider)]
    pub provider: Option<Provider>,

    /// Model to request
    #[arg(short, long, value_name = "NAME", value_parser = parse_model)]
    pub model: Option<String>,

    /// Words of the prompt, joined with spaces
    #[arg(trailing_var_arg = true)]
    pub prompt: Vec<String>,
}

impl Args {
    /// The one-shot prompt, if any words were given.
    pub fn prompt(&self) -> Option<String> {
        let prompt = self.prompt.join(" ");
        (!prompt.trim().is_empty()).then_some(prompt)
    }
}

fn parse_provider(value: &str) -> Result<Provider, String> {
    Provider::parse(value)
        .ok_or_else(|| format!("unknown provider {value:?} (expected claude, deepseek, or local)"))
}

fn parse_model(value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        return Err("model name must not be empty".to_string());
    }
    Ok(value.to_string())
}
