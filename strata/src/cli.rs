//! Command-line arguments and logging setup.

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// A layered packet stack instance talking to one named peer over shared
/// memory.
#[derive(Parser, Debug)]
#[command(name = "strata", version)]
pub struct Args {
    /// Identifier for this instance's mailbox and semaphore
    pub source_id: String,
    /// Identifier of the instance to send messages to
    pub destination_id: String,
    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
    /// Seconds between driver messages
    #[arg(long, default_value_t = 10)]
    pub interval: u64,
}

/// Installs the global log subscriber. Only called once at startup.
pub fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("{error:?}");
    }
}
