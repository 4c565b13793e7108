//! Dump command implementation.

use super::open_existing;
use entistore_core::EntityId;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// One dumped entity.
#[derive(Debug, Serialize)]
pub struct DumpedEntity {
    /// Entity ID.
    pub id: String,
    /// Entity version.
    pub version: u32,
    /// Decoded payload; `null` when it does not decode as a JSON-shaped value.
    pub value: Value,
}

/// Runs the dump command.
pub async fn run(
    path: &Path,
    id: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let only: Option<EntityId> = id.map(str::parse).transpose()?;
    let engine = open_existing(path)?;

    let mut entries = engine.entries().await?;
    entries.sort_by_key(|e| e.key);
    if let Some(only) = only {
        entries.retain(|e| e.key == only);
        if entries.is_empty() {
            engine.close().await?;
            return Err(format!("Entity {only} not found").into());
        }
    }

    let mut dumped = Vec::new();
    for entry in entries.iter().take(limit.unwrap_or(usize::MAX)) {
        let value = match engine.get::<Value>(entry.key).await {
            Ok(value) => value.unwrap_or(Value::Null),
            Err(e) => {
                tracing::warn!(id = %entry.key, error = %e, "payload does not decode");
                Value::Null
            }
        };
        dumped.push(DumpedEntity {
            id: entry.key.to_string(),
            version: entry.version,
            value,
        });
    }
    engine.close().await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&dumped)?),
        _ => print_text_output(&dumped, entries.len()),
    }
    Ok(())
}

fn print_text_output(dumped: &[DumpedEntity], total: usize) {
    println!("Entities ({} of {total})", dumped.len());
    println!("========");
    println!();
    for entity in dumped {
        println!("{} v{}", entity.id, entity.version);
        println!("  {}", entity.value);
    }
}
