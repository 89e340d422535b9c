//! Allocator snapshot data model
//!
//! Structured view of one decoded guest buffer: the firmware memory map
//! plus the page allocator's bookkeeping and a bounded page sample.

use serde::Serialize;

/// Guest page size in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Memory map entry types as reported by the guest bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
    /// Tag this build does not know about
    Unknown(u64),
}

impl RegionKind {
    /// Convert a wire tag to a region kind
    pub fn from_tag(tag: u64) -> Self {
        match tag {
            0 => RegionKind::Usable,
            1 => RegionKind::Reserved,
            2 => RegionKind::AcpiReclaimable,
            3 => RegionKind::AcpiNvs,
            4 => RegionKind::BadMemory,
            5 => RegionKind::BootloaderReclaimable,
            6 => RegionKind::KernelAndModules,
            7 => RegionKind::Framebuffer,
            other => RegionKind::Unknown(other),
        }
    }

    /// Wire tag for this kind
    pub fn tag(&self) -> u64 {
        match self {
            RegionKind::Usable => 0,
            RegionKind::Reserved => 1,
            RegionKind::AcpiReclaimable => 2,
            RegionKind::AcpiNvs => 3,
            RegionKind::BadMemory => 4,
            RegionKind::BootloaderReclaimable => 5,
            RegionKind::KernelAndModules => 6,
            RegionKind::Framebuffer => 7,
            RegionKind::Unknown(tag) => *tag,
        }
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            RegionKind::Usable => "Usable",
            RegionKind::Reserved => "Reserved",
            RegionKind::AcpiReclaimable => "ACPI Reclaimable",
            RegionKind::AcpiNvs => "ACPI NVS",
            RegionKind::BadMemory => "Bad Memory",
            RegionKind::BootloaderReclaimable => "Bootloader Reclaimable",
            RegionKind::KernelAndModules => "Kernel/Modules",
            RegionKind::Framebuffer => "Framebuffer",
            RegionKind::Unknown(_) => "Unknown",
        }
    }
}

/// Page allocator table entry classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Empty,
    HeapSmall,
    HeapMedium,
    HeapLarge,
    Unmanaged,
    PageDirectory,
    PageTable,
    Extension,
    Unknown(u8),
}

impl PageKind {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => PageKind::Empty,
            1 => PageKind::HeapSmall,
            2 => PageKind::HeapMedium,
            3 => PageKind::HeapLarge,
            4 => PageKind::Unmanaged,
            5 => PageKind::PageDirectory,
            6 => PageKind::PageTable,
            7 => PageKind::Extension,
            other => PageKind::Unknown(other),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            PageKind::Empty => 0,
            PageKind::HeapSmall => 1,
            PageKind::HeapMedium => 2,
            PageKind::HeapLarge => 3,
            PageKind::Unmanaged => 4,
            PageKind::PageDirectory => 5,
            PageKind::PageTable => 6,
            PageKind::Extension => 7,
            PageKind::Unknown(tag) => *tag,
        }
    }

    /// Single-character glyph used by text views
    pub fn glyph(&self) -> char {
        match self {
            PageKind::Empty => '.',
            PageKind::HeapSmall => 's',
            PageKind::HeapMedium => 'm',
            PageKind::HeapLarge => 'L',
            PageKind::Unmanaged => 'u',
            PageKind::PageDirectory => 'D',
            PageKind::PageTable => 'T',
            PageKind::Extension => '+',
            PageKind::Unknown(_) => '?',
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, PageKind::Empty)
    }
}

/// One entry of the guest's physical memory map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionEntry {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl RegionEntry {
    /// Exclusive end address (saturating)
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// A sampled page and its allocator class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageEntry {
    pub index: u32,
    /// Physical address, `ram_start + index * PAGE_SIZE`
    pub address: u64,
    pub kind: PageKind,
}

impl PageEntry {
    pub fn new(ram_start: u64, index: u32, kind: PageKind) -> Self {
        Self {
            index,
            address: ram_start.wrapping_add(u64::from(index) * PAGE_SIZE),
            kind,
        }
    }
}

/// Page allocator bookkeeping published by the guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorState {
    pub ram_start: u64,
    pub heap_end: u64,
    pub table_location: u64,
    pub ram_size: u64,
    pub total_page_count: u64,
    pub free_page_count: u64,
    /// Bounded prefix of the allocation table
    pub page_sample: Vec<PageEntry>,
}

impl AllocatorState {
    pub fn used_page_count(&self) -> u64 {
        self.total_page_count.saturating_sub(self.free_page_count)
    }

    /// Percentage of pages in use, 0.0 when the table is empty
    pub fn usage_percent(&self) -> f64 {
        if self.total_page_count == 0 {
            return 0.0;
        }
        self.used_page_count() as f64 * 100.0 / self.total_page_count as f64
    }
}

/// One decoded view of the guest buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    /// Buffer layout version (informational)
    pub version: u32,
    /// Guest-side publish timestamp
    pub captured_at: u64,
    pub memory_map: Vec<RegionEntry>,
    pub allocator: AllocatorState,
}

impl MemorySnapshot {
    /// Total bytes of the memory map marked usable
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|r| r.kind == RegionKind::Usable)
            .map(|r| r.length)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_kind_unknown_tag_preserved() {
        let kind = RegionKind::from_tag(42);
        assert_eq!(kind, RegionKind::Unknown(42));
        assert_eq!(kind.tag(), 42);
        assert_eq!(kind.name(), "Unknown");
    }

    #[test]
    fn test_region_kind_known_tags() {
        for tag in 0..8 {
            assert_eq!(RegionKind::from_tag(tag).tag(), tag);
        }
        assert_eq!(RegionKind::from_tag(7), RegionKind::Framebuffer);
    }

    #[test]
    fn test_page_kind_unknown_tag_preserved() {
        assert_eq!(PageKind::from_tag(200), PageKind::Unknown(200));
        assert_eq!(PageKind::from_tag(200).glyph(), '?');
        assert!(PageKind::Empty.is_free());
        assert!(!PageKind::HeapLarge.is_free());
    }

    #[test]
    fn test_page_entry_address_derived() {
        let entry = PageEntry::new(0x10_0000, 3, PageKind::HeapSmall);
        assert_eq!(entry.address, 0x10_0000 + 3 * 4096);
    }

    #[test]
    fn test_used_page_count_saturates() {
        let state = AllocatorState {
            ram_start: 0,
            heap_end: 0,
            table_location: 0,
            ram_size: 0,
            total_page_count: 10,
            free_page_count: 4,
            page_sample: vec![],
        };
        assert_eq!(state.used_page_count(), 6);
        assert!((state.usage_percent() - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_region_kind_serializes_snake_case() {
        let json = serde_json::to_string(&RegionKind::AcpiNvs).unwrap();
        assert_eq!(json, "\"acpi_nvs\"");
    }
}
