//! The main entrypoint for snapboot, which is just a wrapper for the
//! library.

use anyhow::Result;

fn run() -> Result<()> {
    snapboot_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    snapboot_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    // The error is printed with {:#} to include its full context chain.
    if let Err(e) = run() {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
