//! `coachctx context`: assemble the full prompt context for one turn.

use anyhow::{Context, Result};
use std::path::Path;

use coach_context_core::models::ConversationTurn;

use crate::engine::{ContextRequest, Engine, SearchOptions};

/// History file: either a bare array of turns or an object with a summary.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum HistoryFile {
    Turns(Vec<ConversationTurn>),
    WithSummary {
        #[serde(default)]
        summary: Option<String>,
        turns: Vec<ConversationTurn>,
    },
}

pub fn load_history(path: &Path) -> Result<(Vec<ConversationTurn>, Option<String>)> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    let parsed: HistoryFile =
        serde_json::from_str(&json).with_context(|| "Failed to parse history JSON")?;
    Ok(match parsed {
        HistoryFile::Turns(turns) => (turns, None),
        HistoryFile::WithSummary { summary, turns } => (turns, summary),
    })
}

/// CLI entry point for `coachctx context`.
///
/// Prints the rendered prompt context, or the trace as JSON with `--trace`.
pub async fn run_context(
    engine: &Engine,
    query: Option<String>,
    history: Option<&Path>,
    summary: Option<String>,
    search: SearchOptions,
    max_tokens: Option<usize>,
    trace: bool,
) -> Result<()> {
    let (turns, file_summary) = match history {
        Some(path) => load_history(path)?,
        None => (Vec::new(), None),
    };

    let req = ContextRequest {
        query,
        search,
        turns,
        summary: summary.or(file_summary),
        max_tokens,
    };
    let ctx = engine.context(&req).await?;

    if trace {
        println!("{}", serde_json::to_string_pretty(&ctx.trace)?);
    } else {
        let rendered = ctx.render();
        if rendered.is_empty() {
            println!("(empty context)");
        } else {
            println!("{}", rendered);
        }
    }
    Ok(())
}
