#[macro_use]
mod logging;

mod bridge;
mod checksums;
mod credentials;
mod io;
mod settings;
mod telemetry;

use clap::Parser;

pub use bridge::Cli;

/// Parse the command line and run the bridge. Returns the process exit code.
pub fn run() -> i32 {
    bridge::run(Cli::parse())
}
