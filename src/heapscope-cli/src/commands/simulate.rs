//! Stand-in guest
//!
//! Publishes an evolving buffer into a file so `watch --shm` can be tried
//! without booting a kernel.

use anyhow::{Context, Result};
use heapscope::codec::{BUFFER_VERSION, MAX_PAGE_SAMPLE};
use heapscope::{
    AllocatorState, MemorySnapshot, PageEntry, PageKind, RegionEntry, RegionKind, BUFFER_SIZE,
    PAGE_SIZE,
};
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

const RAM_START: u64 = 0x10_0000;
const RAM_SIZE: u64 = 128 * 1024 * 1024;

/// Page kinds a simulated allocation can take
const HEAP_KINDS: [PageKind; 4] = [
    PageKind::HeapSmall,
    PageKind::HeapMedium,
    PageKind::HeapLarge,
    PageKind::Unmanaged,
];

/// Allocator state of the pretend guest
struct GuestModel {
    tick: u64,
    pages: Vec<PageKind>,
    total_page_count: u64,
    /// Pages in use outside the sample
    unsampled_used: u64,
}

impl GuestModel {
    fn new(sample: usize) -> Self {
        let sample = sample.min(MAX_PAGE_SAMPLE);
        let mut pages = vec![PageKind::Empty; sample];
        // Boot-time paging structures at the bottom of RAM
        for (i, page) in pages.iter_mut().take(4).enumerate() {
            *page = if i == 0 {
                PageKind::PageDirectory
            } else {
                PageKind::PageTable
            };
        }

        Self {
            tick: 0,
            pages,
            total_page_count: RAM_SIZE / PAGE_SIZE,
            unsampled_used: 256,
        }
    }

    /// Allocate and free a few pages
    fn step(&mut self, rng: &mut impl Rng) {
        self.tick += 1;

        for _ in 0..rng.gen_range(1..=8) {
            if self.pages.is_empty() {
                break;
            }
            let i = rng.gen_range(0..self.pages.len());
            self.pages[i] = match self.pages[i] {
                PageKind::Empty => HEAP_KINDS[rng.gen_range(0..HEAP_KINDS.len())],
                PageKind::PageDirectory | PageKind::PageTable => self.pages[i],
                _ => PageKind::Empty,
            };
        }

        let unsampled = self.total_page_count - self.pages.len() as u64;
        let delta: i64 = rng.gen_range(-16..=16);
        self.unsampled_used = self
            .unsampled_used
            .saturating_add_signed(delta)
            .min(unsampled);
    }

    fn snapshot(&self) -> MemorySnapshot {
        let sampled_used = self.pages.iter().filter(|k| !k.is_free()).count() as u64;
        let used = sampled_used + self.unsampled_used;

        MemorySnapshot {
            version: BUFFER_VERSION,
            captured_at: self.tick,
            memory_map: vec![
                RegionEntry {
                    base: 0,
                    length: 0x9_f000,
                    kind: RegionKind::Usable,
                },
                RegionEntry {
                    base: 0x9_f000,
                    length: 0x6_1000,
                    kind: RegionKind::Reserved,
                },
                RegionEntry {
                    base: RAM_START,
                    length: RAM_SIZE,
                    kind: RegionKind::Usable,
                },
                RegionEntry {
                    base: 0xfd00_0000,
                    length: 0x30_0000,
                    kind: RegionKind::Framebuffer,
                },
            ],
            allocator: AllocatorState {
                ram_start: RAM_START,
                heap_end: RAM_START + used * PAGE_SIZE,
                table_location: RAM_START,
                ram_size: RAM_SIZE,
                total_page_count: self.total_page_count,
                free_page_count: self.total_page_count - used,
                page_sample: self
                    .pages
                    .iter()
                    .enumerate()
                    .map(|(i, &kind)| PageEntry::new(RAM_START, i as u32, kind))
                    .collect(),
            },
        }
    }
}

/// Open the output for in-place rewrites. The file never shrinks, so a
/// reader with it mapped never sees it truncated.
fn open_output(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let len = file.metadata()?.len();
    if len < BUFFER_SIZE as u64 {
        file.set_len(BUFFER_SIZE as u64)
            .with_context(|| format!("Failed to size {}", path.display()))?;
    }
    Ok(file)
}

fn publish(file: &File, model: &GuestModel) -> Result<()> {
    let bytes = heapscope::encode(&model.snapshot());
    file.write_all_at(&bytes, 0)
        .context("Failed to publish buffer")
}

pub async fn handle(output: &Path, pages: usize, interval_ms: u64, ticks: Option<u64>) -> Result<()> {
    let file = open_output(output)?;
    let mut model = GuestModel::new(pages);
    let mut rng = rand::thread_rng();

    info!(
        "Publishing {} sampled pages to {} every {} ms",
        model.pages.len(),
        output.display(),
        interval_ms
    );

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = interval.tick() => {
                publish(&file, &model)?;
                if ticks.is_some_and(|limit| model.tick + 1 >= limit) {
                    break;
                }
                model.step(&mut rng);
            }
        }
    }

    info!("Simulator stopped after {} publishes", model.tick + 1);
    Ok(())
}
