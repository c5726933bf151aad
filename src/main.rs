use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use chatd::ChatServer;

#[derive(Parser, Debug)]
#[command(name = "chatd", version, about = "Multi-user TCP chat server")]
struct Cli {
    /// Interface address to listen on
    #[arg(short, long)]
    iface: String,

    /// Port to listen on
    #[arg(short, long)]
    port: u16,
}

/// Two sinks: a human-readable console layer at DEBUG and a journald layer
/// at INFO. The journald layer is skipped when no journal socket is around
/// (containers, dev boxes).
fn init_logging() {
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(LevelFilter::DEBUG);
    let registry = tracing_subscriber::registry().with(console);

    match tracing_journald::layer() {
        Ok(journald) => registry.with(journald.with_filter(LevelFilter::INFO)).init(),
        Err(err) => {
            registry.init();
            warn!("journald sink unavailable ({}), console logging only", err);
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // Help and version are normal termination, anything else is an
            // argument error.
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging();

    let mut server = match ChatServer::bind(&cli.iface, cli.port) {
        Ok(server) => server,
        Err(err) => {
            error!("failed to start on {}:{}: {}", cli.iface, cli.port, err);
            return ExitCode::FAILURE;
        }
    };

    info!("listening on {}", server.local_addr());

    if let Err(err) = server.run() {
        error!("server terminated: {}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
