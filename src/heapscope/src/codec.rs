//! Guest buffer codec
//!
//! The guest kernel publishes a fixed-size, little-endian buffer:
//!
//! | Offset | Size       | Field                                   |
//! |--------|------------|-----------------------------------------|
//! | 0      | 8          | magic (`KMEMVIEW`)                      |
//! | 8      | 4          | version                                 |
//! | 12     | 8          | timestamp                               |
//! | 20     | 4          | memory map count                        |
//! | 24     | 64 * 24    | memory map slots (base, length, kind)   |
//! | 1560   | 6 * 8      | ram start .. free page count            |
//! | 1608   | 4          | page sample count                       |
//! | 1612   | 1000       | page sample, one kind byte per page     |
//!
//! Array regions are always full capacity on the wire; slots past the
//! reported count are never read.

use crate::snapshot::{
    AllocatorState, MemorySnapshot, PageEntry, PageKind, RegionEntry, RegionKind,
};

use byteorder::{ByteOrder, LE};

/// Sentinel at offset 0, the ASCII bytes `KMEMVIEW`
pub const BUFFER_MAGIC: u64 = u64::from_le_bytes(*b"KMEMVIEW");

/// Layout version written by [`encode`]
pub const BUFFER_VERSION: u32 = 1;

/// Memory map capacity
pub const MAX_MEMORY_MAP_ENTRIES: usize = 64;

/// Page sample capacity
pub const MAX_PAGE_SAMPLE: usize = 1000;

/// Size of one memory map slot (base, length, kind)
pub const MEMORY_MAP_ENTRY_SIZE: usize = 24;

pub const MAGIC_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 8;
pub const TIMESTAMP_OFFSET: usize = 12;
pub const MEMORY_MAP_COUNT_OFFSET: usize = 20;
pub const MEMORY_MAP_OFFSET: usize = 24;
pub const ALLOCATOR_OFFSET: usize =
    MEMORY_MAP_OFFSET + MAX_MEMORY_MAP_ENTRIES * MEMORY_MAP_ENTRY_SIZE;
pub const PAGE_SAMPLE_COUNT_OFFSET: usize = ALLOCATOR_OFFSET + 6 * 8;
pub const PAGE_SAMPLE_OFFSET: usize = PAGE_SAMPLE_COUNT_OFFSET + 4;

/// Total wire size of the buffer
pub const BUFFER_SIZE: usize = PAGE_SAMPLE_OFFSET + MAX_PAGE_SAMPLE;

/// Errors from buffer decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Wrong address, or the guest has not published yet
    #[error("Bad buffer magic: expected {expected:#018x}, got {found:#018x}")]
    BadMagic { expected: u64, found: u64 },

    #[error("Truncated buffer: need {needed} bytes, got {actual}")]
    TruncatedBuffer { needed: usize, actual: usize },

    /// Counters contradict each other, usually a read racing the guest writer
    #[error("Inconsistent allocator counters: {free} free of {total} total pages")]
    Inconsistent { free: u64, total: u64 },
}

impl DecodeError {
    /// Whether this only means the guest is not publishing yet
    pub fn is_not_ready(&self) -> bool {
        matches!(self, DecodeError::BadMagic { .. })
    }
}

/// Decode a guest buffer into a snapshot.
///
/// Input longer than [`BUFFER_SIZE`] is accepted; trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<MemorySnapshot, DecodeError> {
    if bytes.len() < BUFFER_SIZE {
        return Err(DecodeError::TruncatedBuffer {
            needed: BUFFER_SIZE,
            actual: bytes.len(),
        });
    }

    let magic = LE::read_u64(&bytes[MAGIC_OFFSET..]);
    if magic != BUFFER_MAGIC {
        return Err(DecodeError::BadMagic {
            expected: BUFFER_MAGIC,
            found: magic,
        });
    }

    let version = LE::read_u32(&bytes[VERSION_OFFSET..]);
    let captured_at = LE::read_u64(&bytes[TIMESTAMP_OFFSET..]);

    let map_count =
        (LE::read_u32(&bytes[MEMORY_MAP_COUNT_OFFSET..]) as usize).min(MAX_MEMORY_MAP_ENTRIES);
    let memory_map = (0..map_count)
        .map(|i| {
            let off = MEMORY_MAP_OFFSET + i * MEMORY_MAP_ENTRY_SIZE;
            RegionEntry {
                base: LE::read_u64(&bytes[off..]),
                length: LE::read_u64(&bytes[off + 8..]),
                kind: RegionKind::from_tag(LE::read_u64(&bytes[off + 16..])),
            }
        })
        .collect();

    let scalar = |n: usize| LE::read_u64(&bytes[ALLOCATOR_OFFSET + n * 8..]);
    let ram_start = scalar(0);
    let heap_end = scalar(1);
    let table_location = scalar(2);
    let ram_size = scalar(3);
    let total_page_count = scalar(4);
    let free_page_count = scalar(5);

    if free_page_count > total_page_count {
        return Err(DecodeError::Inconsistent {
            free: free_page_count,
            total: total_page_count,
        });
    }

    let sample_count =
        (LE::read_u32(&bytes[PAGE_SAMPLE_COUNT_OFFSET..]) as usize).min(MAX_PAGE_SAMPLE);
    let page_sample = bytes[PAGE_SAMPLE_OFFSET..PAGE_SAMPLE_OFFSET + sample_count]
        .iter()
        .enumerate()
        .map(|(i, &tag)| PageEntry::new(ram_start, i as u32, PageKind::from_tag(tag)))
        .collect();

    Ok(MemorySnapshot {
        version,
        captured_at,
        memory_map,
        allocator: AllocatorState {
            ram_start,
            heap_end,
            table_location,
            ram_size,
            total_page_count,
            free_page_count,
            page_sample,
        },
    })
}

/// Encode a snapshot into the guest wire layout.
///
/// Always produces exactly [`BUFFER_SIZE`] bytes. Entries past the array
/// capacities are dropped and unused slots are zero-filled. Page entry
/// addresses are not on the wire; they are re-derived on decode.
pub fn encode(snapshot: &MemorySnapshot) -> Vec<u8> {
    let mut out = vec![0u8; BUFFER_SIZE];

    LE::write_u64(&mut out[MAGIC_OFFSET..], BUFFER_MAGIC);
    LE::write_u32(&mut out[VERSION_OFFSET..], snapshot.version);
    LE::write_u64(&mut out[TIMESTAMP_OFFSET..], snapshot.captured_at);

    let regions = &snapshot.memory_map[..snapshot.memory_map.len().min(MAX_MEMORY_MAP_ENTRIES)];
    LE::write_u32(&mut out[MEMORY_MAP_COUNT_OFFSET..], regions.len() as u32);
    for (i, region) in regions.iter().enumerate() {
        let off = MEMORY_MAP_OFFSET + i * MEMORY_MAP_ENTRY_SIZE;
        LE::write_u64(&mut out[off..], region.base);
        LE::write_u64(&mut out[off + 8..], region.length);
        LE::write_u64(&mut out[off + 16..], region.kind.tag());
    }

    let alloc = &snapshot.allocator;
    for (n, value) in [
        alloc.ram_start,
        alloc.heap_end,
        alloc.table_location,
        alloc.ram_size,
        alloc.total_page_count,
        alloc.free_page_count,
    ]
    .into_iter()
    .enumerate()
    {
        LE::write_u64(&mut out[ALLOCATOR_OFFSET + n * 8..], value);
    }

    let pages = &alloc.page_sample[..alloc.page_sample.len().min(MAX_PAGE_SAMPLE)];
    LE::write_u32(&mut out[PAGE_SAMPLE_COUNT_OFFSET..], pages.len() as u32);
    for (slot, page) in out[PAGE_SAMPLE_OFFSET..].iter_mut().zip(pages) {
        *slot = page.kind.tag();
    }

    out
}
