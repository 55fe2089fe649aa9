//! Line-oriented session loop.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use helm_engine::{
    ApiUsage, Conversation, ErrorKind, GenerationParams, Message, ProviderError, StreamObserver,
    ToolCall, TurnOutcome,
};

use crate::setup::HelmEngine;

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Prints text to stdout and reasoning (dimmed) to stderr as it streams.
#[derive(Debug, Default)]
pub struct TerminalObserver;

impl StreamObserver for TerminalObserver {
    fn on_text_delta(&self, delta: &str) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(delta.as_bytes());
        let _ = out.flush();
    }

    fn on_reasoning_delta(&self, delta: &str) {
        let mut err = io::stderr().lock();
        let _ = write!(err, "{DIM}{delta}{RESET}");
        let _ = err.flush();
    }

    fn on_tool_use(&self, call: &ToolCall) {
        eprintln!("{DIM}[tool call: {}]{RESET}", call.name);
    }

    fn on_usage(&self, usage: ApiUsage) {
        tracing::debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Usage reported"
        );
    }
}

/// How a turn ended, from the user's point of view.
#[derive(Debug)]
pub enum TurnReport {
    Completed(Box<TurnOutcome>),
    Canceled,
    Failed(ProviderError),
}

/// Run one turn, cancelling it on Ctrl-C.
pub async fn run_turn(
    engine: &HelmEngine,
    conversation: Conversation,
    params: &GenerationParams,
) -> TurnReport {
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let result = engine
        .run_turn(conversation, &[], params, &TerminalObserver, &cancel)
        .await;
    watcher.abort();

    match result {
        Ok(outcome) => TurnReport::Completed(Box::new(outcome)),
        Err(error) if error.kind() == ErrorKind::Cancellation => TurnReport::Canceled,
        Err(error) => TurnReport::Failed(error),
    }
}

fn hint(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::Authentication => Some("check the API key for this provider"),
        ErrorKind::RateLimit => Some("the provider is throttling requests; try again shortly"),
        ErrorKind::Inactivity => {
            Some("the stream went silent; raise HELM_STREAM_IDLE_TIMEOUT_SECS for slow models")
        }
        ErrorKind::Transport => Some("the provider could not be reached"),
        ErrorKind::Validation | ErrorKind::Protocol | ErrorKind::Cancellation | ErrorKind::Other => {
            None
        }
    }
}

fn report_failure(error: &ProviderError) {
    eprintln!("error: {error}");
    if let Some(hint) = hint(error.kind()) {
        eprintln!("{DIM}hint: {hint}{RESET}");
    }
}

fn report_outcome(outcome: &TurnOutcome) {
    println!();
    if let Some(stats) = &outcome.compression {
        eprintln!(
            "{DIM}[compressed {} messages into {}, saved ~{} tokens]{RESET}",
            stats.original_count, stats.compressed_count, stats.saved_tokens
        );
    }
    if outcome.truncated > 0 {
        eprintln!(
            "{DIM}[dropped {} older messages to fit the context window]{RESET}",
            outcome.truncated
        );
    }
}

/// Send a single prompt and print the reply.
pub async fn one_shot(engine: &HelmEngine, params: &GenerationParams, prompt: String) -> ExitCode {
    let conversation = Conversation::from(vec![Message::user(prompt)]);
    match run_turn(engine, conversation, params).await {
        TurnReport::Completed(outcome) => {
            report_outcome(&outcome);
            ExitCode::SUCCESS
        }
        TurnReport::Canceled => {
            println!();
            eprintln!("canceled");
            ExitCode::from(130)
        }
        TurnReport::Failed(error) => {
            println!();
            report_failure(&error);
            ExitCode::FAILURE
        }
    }
}

/// What a line of input asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Quit,
    Clear,
    Usage,
    Empty,
    Prompt(&'a str),
}

fn classify(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        "/clear" => Input::Clear,
        "/usage" => Input::Usage,
        _ => Input::Prompt(line.trim_end()),
    }
}

/// Interactive session. Ctrl-C cancels a running turn; at the prompt it exits.
pub async fn interactive(engine: &HelmEngine, params: &GenerationParams) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut conversation = Conversation::new();

    eprintln!(
        "{DIM}helm · {} · /clear resets, /usage shows context, /quit exits{RESET}",
        params.model
    );

    loop {
        eprint!("> ");
        let _ = io::stderr().flush();

        let line = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        let prompt = match classify(&line) {
            Input::Quit => break,
            Input::Empty => continue,
            Input::Clear => {
                conversation = Conversation::new();
                eprintln!("{DIM}[conversation cleared]{RESET}");
                continue;
            }
            Input::Usage => {
                let usage = engine.usage(&conversation, params);
                eprintln!("{DIM}context: {}{RESET}", usage.format_compact());
                continue;
            }
            Input::Prompt(prompt) => prompt.to_string(),
        };

        let mut pending = conversation.clone();
        pending.push(Message::user(prompt));

        match run_turn(engine, pending, params).await {
            TurnReport::Completed(outcome) => {
                report_outcome(&outcome);
                conversation = outcome.into_conversation();
            }
            TurnReport::Canceled => {
                println!();
                eprintln!("canceled");
            }
            TurnReport::Failed(error) => {
                println!();
                report_failure(&error);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Input, classify, hint};
    use helm_engine::ErrorKind;

    #[test]
    fn classifies_commands() {
        assert_eq!(classify("   "), Input::Empty);
        assert_eq!(classify("/quit"), Input::Quit);
        assert_eq!(classify(" /exit "), Input::Quit);
        assert_eq!(classify("/clear"), Input::Clear);
        assert_eq!(classify("/usage"), Input::Usage);
        assert_eq!(classify("explain this\n"), Input::Prompt("explain this"));
    }

    #[test]
    fn cancellation_has_no_failure_hint() {
        assert!(hint(ErrorKind::Cancellation).is_none());
        assert!(hint(ErrorKind::Authentication).is_some());
    }
}
