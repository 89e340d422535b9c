//! CLI argument definitions for heapscope

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "heapscope")]
#[command(about = "Live view of a guest kernel's page allocator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Poll a running guest and show allocator state as it changes
    #[command(visible_alias = "w")]
    Watch {
        /// Hypervisor QMP socket (uses configured default if not provided)
        #[arg(long, env = "HEAPSCOPE_QMP")]
        qmp: Option<PathBuf>,

        /// Kernel image or nm listing used to find the buffer symbol
        #[arg(short, long)]
        kernel: Option<PathBuf>,

        /// Buffer address, skipping symbol lookup (e.g. 0xffffffff80200000)
        #[arg(short, long, value_parser = parse_address)]
        address: Option<u64>,

        /// Shared-memory file backing guest RAM (preferred over --qmp)
        #[arg(long, env = "HEAPSCOPE_SHM")]
        shm: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Poll interval in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Decode a raw buffer dump
    #[command(visible_alias = "d")]
    Decode {
        /// Path to the dumped buffer
        input: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Act as a guest, publishing an evolving buffer into a file
    Simulate {
        /// File to write the buffer into
        output: PathBuf,

        /// Number of sampled pages
        #[arg(short, long, default_value = "512")]
        pages: usize,

        /// Publish interval in milliseconds
        #[arg(short, long, default_value = "500")]
        interval_ms: u64,

        /// Stop after this many publishes
        #[arg(short, long)]
        ticks: Option<u64>,
    },

    /// Configure default settings
    #[command(visible_alias = "c")]
    Configure {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Set default QMP socket
        #[arg(long)]
        qmp: Option<PathBuf>,

        /// Set default shared-memory file
        #[arg(long)]
        shm: Option<PathBuf>,

        /// Set default kernel image
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Set default poll interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Parse a hex (0x-prefixed) or decimal address
pub fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0xffffffff80200000"), Ok(0xffff_ffff_8020_0000));
        assert_eq!(parse_address("0X1000"), Ok(0x1000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert_eq!(parse_address("0x8020_0000"), Ok(0x8020_0000));
        assert!(parse_address("kernel").is_err());
    }

    #[test]
    fn test_watch_args() {
        let cli = Cli::try_parse_from([
            "heapscope",
            "watch",
            "--qmp",
            "/tmp/qmp.sock",
            "--address",
            "0x200000",
            "--format",
            "json",
        ])
        .unwrap();

        match cli.command {
            Commands::Watch {
                qmp,
                address,
                format,
                ..
            } => {
                assert_eq!(qmp, Some(PathBuf::from("/tmp/qmp.sock")));
                assert_eq!(address, Some(0x200000));
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected watch"),
        }
    }
}
