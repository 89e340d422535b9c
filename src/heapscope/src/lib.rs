//! # heapscope
//!
//! Live view of a guest kernel's physical-memory allocator.
//!
//! The guest publishes a fixed-layout snapshot buffer; this library:
//! - Fetches the buffer over the hypervisor's QMP socket or a shared-memory file
//! - Resolves the buffer's guest address from the kernel's symbol table
//! - Decodes the buffer into a [`MemorySnapshot`]
//! - Polls once per interval and publishes full renders or incremental patches
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use heapscope::{PollingController, WatchConfig, WatchTarget};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let target = WatchTarget::select(
//!     None,
//!     Some("/tmp/qmp.sock".into()),
//!     Some("build/kernel.elf".into()),
//!     None,
//! )
//! .ok_or("nothing to watch")?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<heapscope::DisplayUpdate>();
//! let mut controller =
//!     PollingController::for_target(&target, &WatchConfig::default(), Arc::new(|| true), tx);
//!
//! controller.start().await?;
//! while let Some(update) = rx.recv().await {
//!     println!("{:?}", update);
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod poller;
pub mod publisher;
pub mod resolver;
pub mod snapshot;
pub mod transport;

#[doc(inline)]
pub use codec::{decode, encode, DecodeError, BUFFER_SIZE};
#[doc(inline)]
pub use config::WatchConfig;
#[doc(inline)]
pub use poller::{PollState, PollingController, SessionProbe, TickOutcome};
#[doc(inline)]
pub use publisher::{DisplaySink, DisplayUpdate, PublishKind, SnapshotPatch, UpdatePublisher};
#[doc(inline)]
pub use resolver::{AddressResolver, ResolutionError, SymbolSource};
#[doc(inline)]
pub use snapshot::{
    AllocatorState, MemorySnapshot, PageEntry, PageKind, RegionEntry, RegionKind, PAGE_SIZE,
};
#[doc(inline)]
pub use transport::{
    MonitorTransport, SessionTransport, SharedMemoryTransport, Transport, TransportError,
    WatchTarget,
};
