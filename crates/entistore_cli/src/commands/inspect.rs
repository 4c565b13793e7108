//! Inspect command implementation.

use super::{format_size, open_existing};
use entistore_core::record::STORE_HEADER_LEN;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Payload serializer named in the store header.
    pub serializer: String,
    /// Entity log size in bytes.
    pub store_size: u64,
    /// Number of active entities.
    pub entity_count: usize,
    /// Bytes held by active records.
    pub active_bytes: u64,
    /// Bytes shrink would release.
    pub reclaimable_bytes: u64,
    /// Index logs found on disk.
    pub index_logs: Vec<IndexLogInfo>,
    /// Active records, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryInfo>>,
}

/// One index log file.
#[derive(Debug, Serialize)]
pub struct IndexLogInfo {
    /// Index name.
    pub name: String,
    /// Log size in bytes.
    pub size: u64,
}

/// One active record.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Entity ID.
    pub id: String,
    /// Offset in the entity log.
    pub offset: u64,
    /// Record size in bytes.
    pub size: u32,
    /// Entity version.
    pub version: u32,
}

/// Runs the inspect command.
pub async fn run(
    path: &Path,
    show_entries: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_existing(path)?;

    let entries = engine.entries().await?;
    let active_bytes: u64 = entries.iter().map(|e| u64::from(e.size)).sum();
    let store_size = engine.store_len().await?;
    let result = InspectResult {
        path: path.display().to_string(),
        serializer: engine.serializer().await?.to_string(),
        store_size,
        entity_count: entries.len(),
        active_bytes,
        reclaimable_bytes: store_size.saturating_sub(STORE_HEADER_LEN + active_bytes),
        index_logs: index_logs(&path.join("indexes"))?,
        entries: show_entries.then(|| {
            entries
                .iter()
                .map(|e| EntryInfo {
                    id: e.key.to_string(),
                    offset: e.offset,
                    size: e.size,
                    version: e.version,
                })
                .collect()
        }),
    };
    engine.close().await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn index_logs(dir: &Path) -> Result<Vec<IndexLogInfo>, Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut logs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("idx") {
            continue;
        }
        if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
            logs.push(IndexLogInfo {
                name: name.to_owned(),
                size: entry.metadata()?.len(),
            });
        }
    }
    logs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(logs)
}

fn print_text_output(result: &InspectResult) {
    println!("EntiStore Inspection");
    println!("====================");
    println!();
    println!("Path:       {}", result.path);
    println!("Serializer: {}", result.serializer);
    println!();
    println!("Entity log:");
    println!("  Size:        {}", format_size(result.store_size));
    println!("  Active:      {}", format_size(result.active_bytes));
    println!("  Reclaimable: {}", format_size(result.reclaimable_bytes));
    println!("  Entities:    {}", result.entity_count);

    if !result.index_logs.is_empty() {
        println!();
        println!("Index logs:");
        for log in &result.index_logs {
            println!("  {:<20} {}", log.name, format_size(log.size));
        }
    }

    if let Some(entries) = &result.entries {
        println!();
        println!("Records:");
        for e in entries {
            println!(
                "  {} v{} @{} ({} bytes)",
                e.id, e.version, e.offset, e.size
            );
        }
    }
}
