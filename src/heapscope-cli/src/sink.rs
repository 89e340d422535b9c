//! Terminal display sinks

use heapscope::{DisplaySink, DisplayUpdate, MemorySnapshot, SnapshotPatch, PAGE_SIZE};
use std::fmt::Write as _;
use std::io::{self, Write};
use tracing::debug;

/// Pages per row in the page grid
const GRID_WIDTH: usize = 64;

/// Human-readable output, one block per update
pub struct TextSink<W> {
    out: W,
}

impl TextSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send> TextSink<W> {
    #[cfg(test)]
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> DisplaySink for TextSink<W> {
    fn show(&mut self, update: DisplayUpdate) {
        let text = match &update {
            DisplayUpdate::Loading => "Waiting for guest buffer...\n".to_string(),
            DisplayUpdate::Full(snapshot) => render_full(snapshot),
            DisplayUpdate::Patch(patch) => render_patch(patch),
            DisplayUpdate::Failed { message } => format!("Live view failed: {}\n", message),
        };

        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            debug!("Failed to write update: {}", e);
        }
    }
}

/// One JSON object per line
pub struct JsonSink<W> {
    out: W,
}

impl JsonSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send> DisplaySink for JsonSink<W> {
    fn show(&mut self, update: DisplayUpdate) {
        let result = serde_json::to_writer(&mut self.out, &update)
            .map_err(io::Error::from)
            .and_then(|_| writeln!(self.out))
            .and_then(|_| self.out.flush());

        if let Err(e) = result {
            debug!("Failed to write update: {}", e);
        }
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Full text view of a snapshot
pub fn render_full(snapshot: &MemorySnapshot) -> String {
    let alloc = &snapshot.allocator;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "=== Snapshot v{} @ {} ===",
        snapshot.version, snapshot.captured_at
    );

    let _ = writeln!(out, "\nMemory map ({} regions):", snapshot.memory_map.len());
    for region in &snapshot.memory_map {
        let _ = writeln!(
            out,
            "  {:#018x}-{:#018x}  {:>10}  {}",
            region.base,
            region.end(),
            format_size(region.length),
            region.kind.name()
        );
    }
    let _ = writeln!(out, "  usable: {}", format_size(snapshot.usable_bytes()));

    let _ = writeln!(out, "\nAllocator:");
    let _ = writeln!(out, "  RAM start:      {:#x}", alloc.ram_start);
    let _ = writeln!(out, "  Heap end:       {:#x}", alloc.heap_end);
    let _ = writeln!(out, "  Table:          {:#x}", alloc.table_location);
    let _ = writeln!(out, "  RAM size:       {}", format_size(alloc.ram_size));
    let _ = writeln!(
        out,
        "  Pages:          {} used / {} total ({:.1}%), {} free",
        alloc.used_page_count(),
        alloc.total_page_count,
        alloc.usage_percent(),
        alloc.free_page_count
    );

    if !alloc.page_sample.is_empty() {
        let _ = writeln!(
            out,
            "\nPage sample ({} pages, {} each):",
            alloc.page_sample.len(),
            format_size(PAGE_SIZE)
        );
        for row in alloc.page_sample.chunks(GRID_WIDTH) {
            let glyphs: String = row.iter().map(|p| p.kind.glyph()).collect();
            let _ = writeln!(out, "  {:#014x}  {}", row[0].address, glyphs);
        }
    }

    out
}

/// One-line summary of a patch, plus the changed pages
pub fn render_patch(patch: &SnapshotPatch) -> String {
    let c = &patch.counters;
    let mut out = format!(
        "[{}] {} used / {} total, {} free ({} of {})",
        patch.captured_at,
        c.used_page_count,
        c.total_page_count,
        c.free_page_count,
        format_size(c.used_page_count * PAGE_SIZE),
        format_size(c.ram_size)
    );

    if patch.changed_pages.is_empty() {
        out.push('\n');
        return out;
    }

    let _ = writeln!(out, ", {} pages changed", patch.changed_pages.len());
    for change in &patch.changed_pages {
        let _ = writeln!(out, "  page {:>4} -> {:?}", change.index, change.kind);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope::publisher::{Counters, PageChange};
    use heapscope::{AllocatorState, PageEntry, PageKind, RegionEntry, RegionKind};

    fn snapshot() -> MemorySnapshot {
        MemorySnapshot {
            version: 1,
            captured_at: 42,
            memory_map: vec![RegionEntry {
                base: 0x10_0000,
                length: 0x800_0000,
                kind: RegionKind::Usable,
            }],
            allocator: AllocatorState {
                ram_start: 0x10_0000,
                heap_end: 0x20_0000,
                table_location: 0x10_0000,
                ram_size: 0x800_0000,
                total_page_count: 32768,
                free_page_count: 32000,
                page_sample: (0..70)
                    .map(|i| {
                        let kind = if i < 2 {
                            PageKind::PageDirectory
                        } else {
                            PageKind::Empty
                        };
                        PageEntry::new(0x10_0000, i, kind)
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(4096), "4.0 KiB");
        assert_eq!(format_size(0x800_0000), "128.0 MiB");
    }

    #[test]
    fn test_render_full() {
        let text = render_full(&snapshot());
        assert!(text.contains("Snapshot v1 @ 42"));
        assert!(text.contains("Usable"));
        assert!(text.contains("768 used / 32768 total"));
        // 70 pages wrap onto two grid rows
        assert!(text.contains(&format!("DD{}", ".".repeat(62))));
        assert!(text.contains(&format!("{:#014x}  ......", 0x10_0000 + 64 * 4096)));
    }

    #[test]
    fn test_render_patch() {
        let patch = SnapshotPatch {
            captured_at: 7,
            counters: Counters {
                ram_size: 0x800_0000,
                total_page_count: 100,
                free_page_count: 90,
                used_page_count: 10,
            },
            changed_pages: vec![PageChange {
                index: 3,
                kind: PageKind::HeapSmall,
            }],
        };
        let text = render_patch(&patch);
        assert!(text.starts_with("[7] 10 used / 100 total, 90 free"));
        assert!(text.contains("1 pages changed"));
        assert!(text.contains("page    3 -> HeapSmall"));
    }

    #[test]
    fn test_text_sink_writes_updates() {
        let mut sink = TextSink::new(Vec::new());
        sink.show(DisplayUpdate::Loading);
        sink.show(DisplayUpdate::Failed {
            message: "symbol missing".to_string(),
        });
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            out,
            "Waiting for guest buffer...\nLive view failed: symbol missing\n"
        );
    }

    #[test]
    fn test_json_sink_one_object_per_line() {
        let mut sink = JsonSink { out: Vec::new() };
        sink.show(DisplayUpdate::Loading);
        sink.show(DisplayUpdate::Full(snapshot()));

        let out = String::from_utf8(sink.out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let full: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(full["type"], "full");
        assert_eq!(full["allocator"]["free_page_count"], 32000);
    }
}
