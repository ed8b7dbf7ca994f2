use std::time::Instant;

use anyhow::{Context, Result};
use tracing::warn;

use super::{print_json, OutputFormat, Workspace};
use codeatlas::index::Tier;
use codeatlas::query::{QueryResponse, QuerySession};

pub fn query(
    workspace: &Workspace,
    text: &str,
    max_tokens: Option<usize>,
    offset: usize,
    format: OutputFormat,
) -> Result<()> {
    let engine = workspace.engine();
    let started = Instant::now();
    let response = engine
        .query(text, max_tokens, offset)
        .with_context(|| format!("Query failed: {}", text))?;
    finish(workspace, &response, started, format)
}

pub fn find(
    workspace: &Workspace,
    name: &str,
    limit: Option<usize>,
    offset: usize,
    format: OutputFormat,
) -> Result<()> {
    let engine = workspace.engine();
    let limit = limit.unwrap_or(workspace.config.query.default_limit);
    let started = Instant::now();
    let response = engine
        .find(name, limit, offset)
        .with_context(|| format!("Lookup failed: {}", name))?;
    finish(workspace, &response, started, format)
}

pub fn show(
    workspace: &Workspace,
    path: &str,
    max_tokens: Option<usize>,
    offset: usize,
    format: OutputFormat,
) -> Result<()> {
    let engine = workspace.engine();
    let started = Instant::now();
    let response = engine
        .show(path, max_tokens, offset)
        .with_context(|| format!("Failed to list {}", path))?;
    finish(workspace, &response, started, format)
}

pub fn exports(
    workspace: &Workspace,
    limit: Option<usize>,
    offset: usize,
    format: OutputFormat,
) -> Result<()> {
    let engine = workspace.engine();
    let limit = limit.unwrap_or(workspace.config.query.default_limit);
    let started = Instant::now();
    let response = engine.exports(limit, offset).context("Failed to list exports")?;
    finish(workspace, &response, started, format)
}

fn finish(
    workspace: &Workspace,
    response: &QueryResponse,
    started: Instant,
    format: OutputFormat,
) -> Result<()> {
    let latency_ms = started.elapsed().as_millis() as u64;

    let mut session = QuerySession::load(&workspace.paths.session_path);
    session.record(response, latency_ms);
    if let Err(e) = session.save(&workspace.paths.session_path) {
        warn!("Failed to save session telemetry: {}", e);
    }

    match format {
        OutputFormat::Json => print_json(response),
        OutputFormat::Text => {
            print!("{}", render(response));
            Ok(())
        }
    }
}

/// Plain-text rendering of a response.
pub fn render(response: &QueryResponse) -> String {
    let mut out = String::new();

    if let Some(header) = &response.header {
        out.push_str(header);
        out.push_str("\n\n");
    }

    if response.results.is_empty() && response.total == 0 {
        match &response.target {
            Some(target) => out.push_str(&format!("No results for '{}'\n", target)),
            None => out.push_str("No results\n"),
        }
    }

    for item in &response.results {
        out.push_str(&item.text);
        out.push('\n');
        if item.tier != Tier::Compact {
            out.push('\n');
        }
    }

    if !response.related.is_empty() {
        out.push_str("\ncalls:\n");
        for item in &response.related {
            out.push_str("  ");
            out.push_str(&item.text);
            out.push('\n');
        }
    }

    if response.total > 0 {
        out.push_str(&format!(
            "\n[{} of {} shown, {} tokens",
            response.shown, response.total, response.tokens_used
        ));
        if response.tokens_saved() > 0 {
            out.push_str(&format!(", ~{} saved", response.tokens_saved()));
        }
        if response.cached {
            out.push_str(", cached");
        }
        out.push_str("]\n");
    }

    if let Some(next) = response.next_offset {
        out.push_str(&format!(
            "{} more; continue with --offset {}\n",
            response.total - next,
            next
        ));
    }

    if !response.suggestions.is_empty() {
        out.push_str("\nTry:\n");
        for suggestion in &response.suggestions {
            out.push_str(&format!("  {}\n", suggestion));
        }
    }

    out
}
