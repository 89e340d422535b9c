//! Snapshot publishing
//!
//! Redrawing the whole page map every poll flickers, so after the first
//! full render the publisher only sends what changed: the scalar
//! counters plus the pages whose kind differs from the last publish.

use crate::snapshot::{AllocatorState, MemorySnapshot, PageKind};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Cheap scalar counters, sent with every patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub ram_size: u64,
    pub total_page_count: u64,
    pub free_page_count: u64,
    pub used_page_count: u64,
}

impl From<&AllocatorState> for Counters {
    fn from(state: &AllocatorState) -> Self {
        Self {
            ram_size: state.ram_size,
            total_page_count: state.total_page_count,
            free_page_count: state.free_page_count,
            used_page_count: state.used_page_count(),
        }
    }
}

/// A page whose kind changed since the last publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageChange {
    pub index: u32,
    pub kind: PageKind,
}

/// Incremental update against the previously published snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotPatch {
    pub captured_at: u64,
    pub counters: Counters,
    pub changed_pages: Vec<PageChange>,
}

/// What the display receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayUpdate {
    /// Placeholder until the first full render
    Loading,
    Full(MemorySnapshot),
    Patch(SnapshotPatch),
    /// Session-fatal problem the user needs to see
    Failed { message: String },
}

/// Downstream display surface
pub trait DisplaySink: Send {
    fn show(&mut self, update: DisplayUpdate);
}

impl DisplaySink for UnboundedSender<DisplayUpdate> {
    fn show(&mut self, update: DisplayUpdate) {
        if self.send(update).is_err() {
            debug!("Display receiver dropped, update discarded");
        }
    }
}

impl DisplaySink for Vec<DisplayUpdate> {
    fn show(&mut self, update: DisplayUpdate) {
        self.push(update);
    }
}

/// Which form a publish took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishKind {
    Full,
    Patch { changed: usize },
}

/// Decides between full renders and patches, owning the baseline
pub struct UpdatePublisher<D> {
    sink: D,
    last: Option<MemorySnapshot>,
}

impl<D: DisplaySink> UpdatePublisher<D> {
    pub fn new(sink: D) -> Self {
        Self { sink, last: None }
    }

    /// Start a display session: forget the baseline and show a placeholder
    pub fn begin(&mut self) {
        self.last = None;
        self.sink.show(DisplayUpdate::Loading);
    }

    /// Forget the baseline so the next publish is a full render
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn publish(&mut self, snapshot: MemorySnapshot) -> PublishKind {
        let patch = self.last.as_ref().and_then(|prev| diff(prev, &snapshot));

        let kind = match patch {
            Some(patch) => {
                let changed = patch.changed_pages.len();
                trace!("Publishing patch with {} changed pages", changed);
                self.sink.show(DisplayUpdate::Patch(patch));
                PublishKind::Patch { changed }
            }
            None => {
                debug!(
                    "Publishing full render ({} pages sampled)",
                    snapshot.allocator.page_sample.len()
                );
                self.sink.show(DisplayUpdate::Full(snapshot.clone()));
                PublishKind::Full
            }
        };

        self.last = Some(snapshot);
        kind
    }

    /// Surface a session-fatal error
    pub fn fail(&mut self, message: impl Into<String>) {
        self.sink.show(DisplayUpdate::Failed {
            message: message.into(),
        });
    }

    pub fn last(&self) -> Option<&MemorySnapshot> {
        self.last.as_ref()
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut D {
        &mut self.sink
    }
}

/// Patch from `prev` to `next`, or None when only a full render is valid
fn diff(prev: &MemorySnapshot, next: &MemorySnapshot) -> Option<SnapshotPatch> {
    let (old, new) = (&prev.allocator, &next.allocator);

    // Page indices (or their addresses) no longer line up
    if old.page_sample.len() != new.page_sample.len() || old.ram_start != new.ram_start {
        return None;
    }
    // Patches carry no region data
    if prev.memory_map != next.memory_map {
        return None;
    }

    let changed_pages = old
        .page_sample
        .iter()
        .zip(&new.page_sample)
        .filter(|(a, b)| a.kind != b.kind)
        .map(|(_, b)| PageChange {
            index: b.index,
            kind: b.kind,
        })
        .collect();

    Some(SnapshotPatch {
        captured_at: next.captured_at,
        counters: Counters::from(new),
        changed_pages,
    })
}
