//! Verify command implementation.

use super::{format_size, open_existing};
use entistore_core::VerifyReport;
use std::path::Path;

/// Runs the verify command.
pub async fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let engine = open_existing(path)?;
    let report = engine.verify().await?;
    engine.close().await?;

    print_report(&report);
    println!();
    if report.is_healthy() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

fn print_report(report: &VerifyReport) {
    println!("Entity log:");
    println!("  Size:             {}", format_size(report.store_len));
    println!("  Records scanned:  {}", report.scan.records);
    println!("  Free records:     {}", report.scan.free);
    println!("  Corrupt records:  {}", report.scan.corrupt);
    match report.scan.torn_tail {
        Some(offset) => println!("  Torn tail:        at offset {offset}"),
        None => println!("  Torn tail:        none"),
    }
    println!();
    println!("Entities:");
    println!("  Active:           {}", report.active);
    println!("  Reclaimable:      {}", format_size(report.reclaimable_bytes()));

    for id in &report.undecodable {
        println!("  ✗ {id}: payload does not decode");
    }
    for id in &report.missing {
        println!("  ✗ {id}: record not found in log");
    }
}
