//! Version command implementation.

/// Runs the version command.
pub fn run() {
    println!("EntiStore CLI v{}", env!("CARGO_PKG_VERSION"));
    println!("EntiStore Core v{}", entistore_core::VERSION);
}
