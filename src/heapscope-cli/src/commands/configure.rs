//! Configuration command handlers
//!
//! Handles the `configure` subcommand for setting up heapscope defaults.

use crate::config::Config;
use anyhow::Result;
use std::path::PathBuf;

/// Values to store; `None` leaves the current setting alone
#[derive(Debug, Default)]
pub struct Changes {
    pub qmp: Option<PathBuf>,
    pub shm: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    pub interval_ms: Option<u64>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.qmp.is_none()
            && self.shm.is_none()
            && self.kernel.is_none()
            && self.interval_ms.is_none()
    }

    fn apply(self, config: &mut Config) {
        if let Some(qmp) = self.qmp {
            config.qmp_socket = Some(qmp);
        }
        if let Some(shm) = self.shm {
            config.shm_path = Some(shm);
        }
        if let Some(kernel) = self.kernel {
            config.kernel = Some(kernel);
        }
        if let Some(ms) = self.interval_ms {
            config.watch.poll_interval_ms = ms;
        }
    }
}

/// Handle the configure command
pub fn handle(show: bool, changes: Changes) -> Result<()> {
    let mut config = Config::load()?;

    if show {
        show_config(&config);
        return Ok(());
    }

    if changes.is_empty() {
        show_usage();
        return Ok(());
    }

    changes.apply(&mut config);
    config.save()?;

    println!("Configuration updated");
    if let Ok(path) = Config::config_path() {
        println!("Config saved to: {}", path.display());
    }

    Ok(())
}

fn show_config(config: &Config) {
    let describe = |value: &Option<PathBuf>| {
        value
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not set)".to_string())
    };

    println!("QMP socket:    {}", describe(&config.qmp_socket));
    println!("Shared memory: {}", describe(&config.shm_path));
    println!("Kernel:        {}", describe(&config.kernel));
    println!("Poll interval: {} ms", config.watch.poll_interval_ms);
    println!("Symbols:       {}", config.watch.symbols.join(", "));

    if let Ok(path) = Config::config_path() {
        println!("Config file: {}", path.display());
    }
}

fn show_usage() {
    println!("Usage: heapscope configure --qmp SOCKET [--kernel ELF]");
    println!("   or: heapscope configure --shm FILE");
    println!("   or: heapscope configure --show");
}
