//! `avllm chat`: a line-based conversation in the terminal

use crate::runtime::{load_engine, RunOptions};
use anyhow::Result;
use crossterm::style::Stylize;
use llama_chat::{ChatError, InferenceEngine, MessageRole, SamplingParams, SessionId, SessionState};
use std::io::{BufRead, Write};
use std::ops::ControlFlow;
use tracing::{debug, warn};

pub async fn run(options: RunOptions, model: &str) -> Result<()> {
    let engine = load_engine(&options, model).await?;
    let sampling = options.sampling()?;
    let context = options.context.clone();
    let n_predict = options.n_predict;

    tokio::task::spawn_blocking(move || {
        let mut session = SessionState::new(SessionId::new(), context);
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        repl(
            engine.as_ref(),
            &mut session,
            &sampling,
            n_predict,
            stdin.lock(),
            stdout.lock(),
        )
    })
    .await??;
    Ok(())
}

/// Read the system message, then one user message per line until an empty
/// line, streaming every reply to `output`
pub fn repl(
    engine: &dyn InferenceEngine,
    session: &mut SessionState,
    sampling: &SamplingParams,
    n_predict: usize,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<()> {
    let mut lines = input.lines();

    write!(output, "system> ")?;
    output.flush()?;
    let system = match lines.next() {
        Some(line) => line?,
        None => return Ok(()),
    };
    if system.trim().is_empty() {
        return Ok(());
    }
    session.append(MessageRole::System, system.trim())?;

    loop {
        write!(output, "> ")?;
        output.flush()?;
        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        let mut write_failed = None;
        let result = session.turn(
            engine,
            MessageRole::User,
            line,
            sampling,
            n_predict,
            &mut |piece| match output.write_all(piece.as_bytes()).and_then(|_| output.flush()) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    write_failed = Some(e);
                    ControlFlow::Break(())
                }
            },
        );
        if let Some(e) = write_failed {
            return Err(e.into());
        }
        writeln!(output)?;

        match result {
            Ok(outcome) => debug!(
                "Reply of {} tokens ({})",
                outcome.tokens_generated,
                outcome.finish_reason.as_openai()
            ),
            Err(ChatError::ContextExceeded { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        if session.is_exhausted() {
            warn!("Context of {} tokens is full", session.used_cells());
            writeln!(
                output,
                "{}",
                "Context is full, ending the chat. Start again with a larger --ctx.".yellow()
            )?;
            break;
        }
    }
    Ok(())
}
