//! Shrink command implementation.

use super::{format_size, open_existing};
use std::path::Path;

/// Runs the shrink command.
pub async fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Shrinking store at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let engine = open_existing(path)?;
    let verify = engine.verify().await?;
    let reclaimable = verify.reclaimable_bytes();

    println!("Shrink Analysis:");
    println!("  Active entities: {}", verify.active);
    println!("  Free records:    {}", verify.scan.free);
    println!("  Size before:     {}", format_size(verify.store_len));
    println!(
        "  Reclaimable:     {} ({:.1}%)",
        format_size(reclaimable),
        if verify.store_len > 0 {
            reclaimable as f64 / verify.store_len as f64 * 100.0
        } else {
            0.0
        }
    );

    if !verify.is_healthy() {
        engine.close().await?;
        return Err("Store has integrity problems; run verify first".into());
    }

    if !dry_run {
        println!();
        if reclaimable == 0 {
            println!("No shrink needed - log is already contiguous");
        } else {
            println!("Performing shrink...");
            let report = engine.shrink().await?;
            println!(
                "✓ Shrink complete: moved {} records, {} -> {}",
                report.records_moved,
                format_size(report.bytes_before),
                format_size(report.bytes_after)
            );
        }
    }

    engine.close().await?;
    Ok(())
}
