use std::{
    env::{self, VarError},
    io,
};

use anyhow::{Context, Result};
use buddy_shell::Shell;
use clap::Parser;
use tracing::Level;

/// Environment variable holding the log level.
const LOG_ENV: &str = "BUDDY_SHELL_LOG";

#[derive(Parser, Debug)]
#[command(name = "buddy_shell", about = "Simulate a server's memory with a buddy allocator")]
struct Args {
    /// Total memory size in KB. Prompted for when absent.
    #[arg(short, long, value_name = "KB")]
    capacity: Option<usize>,
}

fn log_level() -> Result<Level> {
    match env::var(LOG_ENV) {
        Ok(level) => level
            .parse()
            .with_context(|| format!("invalid {LOG_ENV} level `{level}`")),
        Err(VarError::NotPresent) => Ok(Level::WARN),
        Err(e) => Err(e).context(LOG_ENV),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(log_level()?)
        .init();

    let mut shell = Shell::new(io::stdin().lock(), io::stdout().lock());
    shell.run(args.capacity)
}
