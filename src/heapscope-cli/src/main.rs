mod cli;
mod commands;
mod config;
mod sink;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "heapscope=info,heapscope_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Everything runs cooperatively on one thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match cli.command {
        Commands::Watch {
            qmp,
            kernel,
            address,
            shm,
            format,
            interval_ms,
        } => {
            runtime.block_on(commands::watch::handle(commands::watch::WatchArgs {
                qmp,
                kernel,
                address,
                shm,
                format,
                interval_ms,
            }))?;
        }

        Commands::Decode { input, json } => {
            commands::decode::handle(&input, json)?;
        }

        Commands::Simulate {
            output,
            pages,
            interval_ms,
            ticks,
        } => {
            runtime.block_on(commands::simulate::handle(&output, pages, interval_ms, ticks))?;
        }

        Commands::Configure {
            show,
            qmp,
            shm,
            kernel,
            interval_ms,
        } => {
            commands::configure::handle(
                show,
                commands::configure::Changes {
                    qmp,
                    shm,
                    kernel,
                    interval_ms,
                },
            )?;
        }
    }

    Ok(())
}
