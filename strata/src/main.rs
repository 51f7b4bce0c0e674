//! The stack driver: brings up one instance and periodically sends a sample
//! message to its peer until interrupted.

mod cli;

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use strata_core::{ExitStatus, Identity, Shutdown, Stack};

const SRC_PORT: u16 = 12345;
const DEST_PORT: u16 = 54321;

#[tokio::main(worker_threads = 4)]
async fn main() -> ExitCode {
    let args = match cli::Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let _ = error.print();
            return ExitCode::from(1);
        }
    };
    cli::init_logging(args.debug);

    tracing::info!(
        source = %args.source_id,
        destination = %args.destination_id,
        "starting instance"
    );

    let stack = match Stack::start(Identity {
        source: args.source_id.clone(),
        destination: args.destination_id.clone(),
    }) {
        Ok(stack) => stack,
        Err(error) => {
            tracing::error!(%error, "initialization failed");
            return ExitCode::from(1);
        }
    };
    tracing::info!("setup complete, press Ctrl+C to exit");

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("SIGINT received, initiating shutdown");
                shutdown.shut_down();
            }
        });
    }

    let mut message_count = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(Duration::from_secs(args.interval)) => {
                message_count += 1;
                let message = format!(
                    "Message {message_count} from {} to {}!",
                    args.source_id, args.destination_id
                );
                tracing::info!(message_count, "attempting to send application message");
                if let Err(error) = stack.send(&message, SRC_PORT, DEST_PORT) {
                    tracing::error!(%error, message_count, "failed to send application message");
                }
            }
        }
    }

    tracing::info!("shutting down");
    stack.shut_down();
    tracing::info!("shutdown complete");

    match shutdown.try_get_status() {
        Some(ExitStatus::Status(code)) => ExitCode::from(code.min(u8::MAX as u32) as u8),
        _ => ExitCode::SUCCESS,
    }
}
