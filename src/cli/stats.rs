use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::json;

use super::{print_json, OutputFormat, Workspace};
use codeatlas::query::{LifetimeStats, QuerySession};

pub fn show_stats(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let stats = workspace.store.stats()?;

    if format == OutputFormat::Json {
        return print_json(&stats);
    }

    println!("Index statistics for {}", workspace.paths.root.display());
    println!("  Files: {}", stats.files);
    println!("  Lines: {}", stats.total_lines);
    println!("  Symbols: {}", stats.symbols);
    println!("  Exported: {}", stats.exported);
    println!("  Tests: {}", stats.tests);
    println!("  Relationships: {}", stats.relationships);
    println!(
        "  Index size: {:.2} MB",
        stats.db_size_bytes as f64 / (1024.0 * 1024.0)
    );
    println!("  Schema version: {}", stats.schema_version);
    match stats.last_full_index.and_then(|ts| Utc.timestamp_opt(ts, 0).single()) {
        Some(at) => println!("  Last full index: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Last full index: never"),
    }

    print_breakdown("Symbols by kind", &stats.by_kind);
    print_breakdown("Files by language", &stats.by_language);
    print_breakdown("Relationships by kind", &stats.by_relationship);
    Ok(())
}

fn print_breakdown(title: &str, rows: &[(String, usize)]) {
    if rows.is_empty() {
        return;
    }
    println!("\n  {}:", title);
    for (name, count) in rows {
        println!("    {}: {}", name, count);
    }
}

pub fn show_session(workspace: &Workspace, end: bool, format: OutputFormat) -> Result<()> {
    let mut session = QuerySession::load(&workspace.paths.session_path);

    if end {
        let lifetime = session.end_session(&workspace.paths.lifetime_path)?;
        session.save(&workspace.paths.session_path)?;
        return match format {
            OutputFormat::Json => print_json(&lifetime),
            OutputFormat::Text => {
                println!("Session ended.");
                print_lifetime(&lifetime);
                Ok(())
            }
        };
    }

    let lifetime = LifetimeStats::load(&workspace.paths.lifetime_path);
    if format == OutputFormat::Json {
        return print_json(&json!({ "session": session, "lifetime": lifetime }));
    }

    println!(
        "Session since {}",
        session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Queries: {}", session.queries);
    println!("  Tokens used: {}", session.tokens_used);
    println!(
        "  Tokens saved: {} ({:.1}%)",
        session.tokens_saved,
        session.savings_percent()
    );
    println!("  Cache hits: {}", session.cache_hits);
    println!("  Average latency: {:.1} ms", session.average_latency_ms());

    if !session.log.is_empty() {
        println!("\n  Recent queries:");
        for entry in session.log.iter().rev().take(10) {
            println!(
                "    [{}] {} ({} tokens{})",
                entry.intent,
                entry.query,
                entry.tokens_used,
                if entry.cached { ", cached" } else { "" }
            );
        }
    }

    print_lifetime(&lifetime);
    Ok(())
}

fn print_lifetime(lifetime: &LifetimeStats) {
    println!("\nLifetime ({} sessions)", lifetime.sessions);
    println!("  Queries: {}", lifetime.queries);
    println!("  Tokens used: {}", lifetime.tokens_used);
    println!("  Tokens saved: {}", lifetime.tokens_saved);
    println!("  Cache hits: {}", lifetime.cache_hits);
}
