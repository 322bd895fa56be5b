//! `coachctx search`: run one knowledge query and print the ranked results.
//!
//! The retrieval algorithm lives in `coach_context_core::search`; this
//! module only handles mode checks and CLI output.

use anyhow::{bail, Result};

use coach_context_core::models::SearchMethod;

use crate::engine::{Engine, SearchOptions};

/// CLI entry point for `coachctx search <query>`.
pub async fn run_search(
    engine: &Engine,
    query: &str,
    opts: &SearchOptions,
    json: bool,
) -> Result<()> {
    let method = opts
        .method
        .unwrap_or(engine.config().retrieval.default_method);
    if method == SearchMethod::Semantic && !engine.config().embedding.is_enabled() {
        bail!("Method 'semantic' requires embeddings. Set [embedding] provider in config.");
    }

    let resp = engine.search(query, opts).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
        return Ok(());
    }

    if resp.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    println!(
        "Search: method={}, top={:.3}, valid={}, {} ms",
        resp.method, resp.top_score, resp.is_valid, resp.response_time_ms
    );
    println!();

    for (i, r) in resp.results.iter().enumerate() {
        let in_context = if i < resp.context_chunks { "*" } else { " " };
        println!(
            "{}{}. [{:.3}] {} / {}",
            in_context,
            i + 1,
            r.combined_score,
            r.owner_tag,
            r.source_title
        );
        match r.lexical_score {
            Some(lex) => println!(
                "    scoring: similarity={:.3}  lexical={:.3}",
                r.similarity_score, lex
            ),
            None => println!("    scoring: similarity={:.3}", r.similarity_score),
        }
        println!("    category: {}", r.source_category);
        println!("    chunk: {}", r.chunk_ref);
        println!("    excerpt: \"{}\"", excerpt(&r.text, 240));
        println!();
    }

    if !resp.is_valid {
        println!("Top score is below the relevance floor; no knowledge would be injected.");
    }

    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= max_chars {
        return flat.to_string();
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}
