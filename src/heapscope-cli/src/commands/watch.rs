//! Live view command
//!
//! Runs a polling controller until interrupted. The debug session counts
//! as active while its socket (or shared-memory file) exists; when it goes
//! away the view stops and picks up again once it reappears.

use crate::cli::OutputFormat;
use crate::config::Config;
use crate::sink::{JsonSink, TextSink};
use anyhow::{Context, Result};
use heapscope::{DisplaySink, PollState, PollingController, SessionProbe, WatchConfig, WatchTarget};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct WatchArgs {
    pub qmp: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    pub address: Option<u64>,
    pub shm: Option<PathBuf>,
    pub format: OutputFormat,
    pub interval_ms: Option<u64>,
}

pub async fn handle(args: WatchArgs) -> Result<()> {
    let config = Config::load()?;
    let format = args.format;
    let (target, watch) = resolve_target(args, config)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            debug!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match format {
        OutputFormat::Text => run(&target, &watch, TextSink::stdout(), shutdown).await,
        OutputFormat::Json => run(&target, &watch, JsonSink::stdout(), shutdown).await,
    }
}

/// Merge flags over configured defaults
fn resolve_target(args: WatchArgs, config: Config) -> Result<(WatchTarget, WatchConfig)> {
    let mut watch = config.watch;
    if let Some(ms) = args.interval_ms {
        watch.poll_interval_ms = ms;
    }

    // An explicit monitor choice on the command line beats a configured shm path
    let shm = match (&args.shm, &args.qmp) {
        (Some(_), _) => args.shm,
        (None, Some(_)) => None,
        (None, None) => config.shm_path,
    };

    let target = WatchTarget::select(
        shm,
        args.qmp.or(config.qmp_socket),
        args.kernel.or(config.kernel),
        args.address,
    )
    .context(
        "Nothing to watch: pass --shm FILE, or --qmp SOCKET with --kernel ELF or --address ADDR",
    )?;

    Ok((target, watch))
}

/// Active while the session's socket or file exists
fn session_probe(target: &WatchTarget) -> Arc<dyn SessionProbe> {
    let path = match target {
        WatchTarget::Monitor { socket, .. } => socket.clone(),
        WatchTarget::SharedMemory { path } => path.clone(),
    };
    Arc::new(move || path.exists())
}

async fn run<D, F>(target: &WatchTarget, config: &WatchConfig, sink: D, shutdown: F) -> Result<()>
where
    D: DisplaySink + 'static,
    F: Future<Output = ()>,
{
    let probe = session_probe(target);
    let mut controller =
        PollingController::for_target(target, config, Arc::clone(&probe), sink);
    let mut states = controller.subscribe();

    let mut idle = tokio::time::interval(config.poll_interval());
    idle.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tokio::pin!(shutdown);
    let mut waiting = false;

    loop {
        if controller.state() != PollState::Live {
            if probe.is_active() {
                waiting = false;
                controller.start().await.context("Live view stopped")?;
            } else if !waiting {
                info!("Waiting for debug session");
                waiting = true;
            }
        }

        tokio::select! {
            _ = &mut shutdown => break,
            Ok(()) = states.changed() => {
                debug!("Live view is now {:?}", *states.borrow_and_update());
            }
            _ = idle.tick() => {}
        }
    }

    controller.dispose().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope::{AllocatorState, DisplayUpdate, MemorySnapshot, SymbolSource};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn args() -> WatchArgs {
        WatchArgs {
            qmp: None,
            kernel: None,
            address: None,
            shm: None,
            format: OutputFormat::Text,
            interval_ms: None,
        }
    }

    #[test]
    fn test_flags_override_config() {
        let config = Config {
            qmp_socket: Some("/run/qmp.sock".into()),
            kernel: Some("kernel.elf".into()),
            ..Default::default()
        };
        let (target, watch) = resolve_target(
            WatchArgs {
                address: Some(0x8000),
                interval_ms: Some(200),
                ..args()
            },
            config,
        )
        .unwrap();

        assert_eq!(
            target,
            WatchTarget::Monitor {
                socket: "/run/qmp.sock".into(),
                symbols: SymbolSource::Fixed(0x8000),
            }
        );
        assert_eq!(watch.poll_interval_ms, 200);
    }

    #[test]
    fn test_explicit_qmp_beats_configured_shm() {
        let config = Config {
            shm_path: Some("/dev/shm/guest".into()),
            ..Default::default()
        };
        let (target, _) = resolve_target(
            WatchArgs {
                qmp: Some("/tmp/qmp.sock".into()),
                kernel: Some("kernel.elf".into()),
                ..args()
            },
            config,
        )
        .unwrap();
        assert!(matches!(target, WatchTarget::Monitor { .. }));
    }

    #[test]
    fn test_configured_shm_used() {
        let config = Config {
            shm_path: Some("/dev/shm/guest".into()),
            ..Default::default()
        };
        let (target, _) = resolve_target(args(), config).unwrap();
        assert_eq!(
            target,
            WatchTarget::SharedMemory {
                path: "/dev/shm/guest".into()
            }
        );
    }

    #[test]
    fn test_nothing_to_watch() {
        let err = resolve_target(args(), Config::default()).unwrap_err();
        assert!(err.to_string().contains("Nothing to watch"));
    }

    #[test]
    fn test_session_probe_follows_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.shm");
        let probe = session_probe(&WatchTarget::SharedMemory { path: path.clone() });

        assert!(!probe.is_active());
        std::fs::write(&path, b"x").unwrap();
        assert!(probe.is_active());
    }

    #[tokio::test]
    async fn test_run_shows_shared_memory_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.shm");
        let snapshot = MemorySnapshot {
            version: 1,
            captured_at: 5,
            memory_map: vec![],
            allocator: AllocatorState {
                ram_start: 0x10_0000,
                heap_end: 0x10_0000,
                table_location: 0x10_0000,
                ram_size: 0x100_0000,
                total_page_count: 4096,
                free_page_count: 4000,
                page_sample: vec![],
            },
        };
        std::fs::write(&path, heapscope::encode(&snapshot)).unwrap();

        let target = WatchTarget::SharedMemory { path };
        let config = WatchConfig {
            poll_interval_ms: 10,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();

        run(
            &target,
            &config,
            tx,
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        assert_eq!(rx.recv().await, Some(DisplayUpdate::Loading));
        assert_eq!(rx.recv().await, Some(DisplayUpdate::Full(snapshot)));
        assert!(matches!(rx.recv().await, Some(DisplayUpdate::Patch(_))));
    }
}
