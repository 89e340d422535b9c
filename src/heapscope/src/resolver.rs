//! Guest buffer address resolution
//!
//! The monitor channel reads guest memory by address, so the buffer's
//! location has to come from the kernel's symbol table. Accepts either a
//! kernel image (ELF or anything else the `object` crate reads) or a
//! plain `nm` listing.

use object::{Object, ObjectSymbol};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Symbol names the guest may export the buffer under, in lookup order
pub const DEFAULT_SYMBOLS: &[&str] = &["memview_buffer", "MEMVIEW_BUFFER", "g_memview_buffer"];

/// Where the buffer address comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolSource {
    /// Kernel image or `nm` listing to search
    SymbolTable(PathBuf),
    /// Address supplied directly, no lookup
    Fixed(u64),
}

/// Errors from address resolution
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("Failed to read symbol table {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse symbol table {}: {}", .path.display(), .message)]
    Parse { path: PathBuf, message: String },

    #[error("None of [{}] found in {}", .candidates.join(", "), .path.display())]
    NotFound {
        path: PathBuf,
        candidates: Vec<String>,
    },
}

/// Resolves and caches the buffer address for one session
#[derive(Debug, Clone)]
pub struct AddressResolver {
    source: SymbolSource,
    candidates: Vec<String>,
    cached: Option<u64>,
}

impl AddressResolver {
    pub fn new(source: SymbolSource, candidates: Vec<String>) -> Self {
        Self {
            source,
            candidates,
            cached: None,
        }
    }

    /// Resolver using [`DEFAULT_SYMBOLS`]
    pub fn with_default_symbols(source: SymbolSource) -> Self {
        Self::new(
            source,
            DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn source(&self) -> &SymbolSource {
        &self.source
    }

    pub fn cached(&self) -> Option<u64> {
        match self.source {
            SymbolSource::Fixed(address) => Some(address),
            SymbolSource::SymbolTable(_) => self.cached,
        }
    }

    /// Return the buffer address, looking it up on first use
    pub fn resolve(&mut self) -> Result<u64, ResolutionError> {
        let path = match &self.source {
            SymbolSource::Fixed(address) => return Ok(*address),
            SymbolSource::SymbolTable(path) => path,
        };

        if let Some(address) = self.cached {
            return Ok(address);
        }

        let (name, address) = lookup_symbol(path, &self.candidates)?;
        info!("Resolved {} to {:#x} from {}", name, address, path.display());
        self.cached = Some(address);
        Ok(address)
    }

    /// Forget the looked-up address. Fixed addresses are kept.
    pub fn clear(&mut self) {
        if self.cached.take().is_some() {
            debug!("Cleared cached buffer address");
        }
    }
}

/// Find the first candidate present in a symbol table
pub fn lookup_symbol(path: &Path, candidates: &[String]) -> Result<(String, u64), ResolutionError> {
    let symbols = load_symbol_table(path)?;
    debug!("Loaded {} symbols from {}", symbols.len(), path.display());

    candidates
        .iter()
        .find_map(|name| symbols.get(name).map(|&address| (name.clone(), address)))
        .ok_or_else(|| ResolutionError::NotFound {
            path: path.to_path_buf(),
            candidates: candidates.to_vec(),
        })
}

fn load_symbol_table(path: &Path) -> Result<HashMap<String, u64>, ResolutionError> {
    let bytes = std::fs::read(path).map_err(|source| ResolutionError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if let Ok(file) = object::File::parse(&*bytes) {
        return Ok(object_symbols(&file));
    }

    let text = std::str::from_utf8(&bytes).map_err(|_| ResolutionError::Parse {
        path: path.to_path_buf(),
        message: "neither an object file nor an nm listing".to_string(),
    })?;
    Ok(parse_nm_listing(text))
}

fn object_symbols(file: &object::File<'_>) -> HashMap<String, u64> {
    file.symbols()
        .chain(file.dynamic_symbols())
        .filter(|symbol| !symbol.is_undefined())
        .filter_map(|symbol| {
            symbol
                .name()
                .ok()
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), symbol.address()))
        })
        .collect()
}

/// Parse `nm` output: `<hex address> <type> <name>` per line.
///
/// Undefined symbols (no address column) are skipped.
pub fn parse_nm_listing(text: &str) -> HashMap<String, u64> {
    let mut symbols = HashMap::new();

    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }

        let digits = parts[0].trim_start_matches("0x");
        if let Ok(address) = u64::from_str_radix(digits, 16) {
            symbols.entry(parts[2].to_string()).or_insert(address);
        }
    }

    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn nm_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const LISTING: &str = "\
ffffffff80000000 T _start
                 U external_fn
ffffffff80123440 D g_memview_buffer
ffffffff80123000 B MEMVIEW_BUFFER
";

    #[test]
    fn test_parse_nm_listing() {
        let symbols = parse_nm_listing(LISTING);
        assert_eq!(symbols.len(), 3);
        assert_eq!(symbols["_start"], 0xffff_ffff_8000_0000);
        assert!(!symbols.contains_key("external_fn"));
    }

    #[test]
    fn test_resolve_follows_candidate_order() {
        let file = nm_file(LISTING);
        let mut resolver =
            AddressResolver::with_default_symbols(SymbolSource::SymbolTable(file.path().into()));
        // MEMVIEW_BUFFER precedes g_memview_buffer in the candidate list
        assert_eq!(resolver.resolve().unwrap(), 0xffff_ffff_8012_3000);
    }

    #[test]
    fn test_resolve_not_found() {
        let file = nm_file("ffffffff80000000 T _start\n");
        let mut resolver =
            AddressResolver::with_default_symbols(SymbolSource::SymbolTable(file.path().into()));
        let err = resolver.resolve().unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound { .. }));
        assert!(err.to_string().contains("memview_buffer"));
        assert_eq!(resolver.cached(), None);
    }

    #[test]
    fn test_resolve_missing_file() {
        let mut resolver = AddressResolver::with_default_symbols(SymbolSource::SymbolTable(
            "/nonexistent/kernel.elf".into(),
        ));
        assert!(matches!(
            resolver.resolve(),
            Err(ResolutionError::Io { .. })
        ));
    }

    #[test]
    fn test_resolve_is_cached_until_cleared() {
        let file = nm_file("0000000000201000 D memview_buffer\n");
        let path = file.path().to_path_buf();
        let mut resolver = AddressResolver::with_default_symbols(SymbolSource::SymbolTable(path));

        assert_eq!(resolver.resolve().unwrap(), 0x201000);

        // Symbol table gone: cache still answers
        drop(file);
        assert_eq!(resolver.resolve().unwrap(), 0x201000);

        resolver.clear();
        assert!(resolver.resolve().is_err());
    }

    #[test]
    fn test_fixed_address_survives_clear() {
        let mut resolver = AddressResolver::with_default_symbols(SymbolSource::Fixed(0x8000));
        assert_eq!(resolver.resolve().unwrap(), 0x8000);
        resolver.clear();
        assert_eq!(resolver.cached(), Some(0x8000));
    }

    #[test]
    fn test_resolve_from_elf() {
        use object::write::{Object as WriteObject, StandardSection, Symbol, SymbolSection};
        use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

        let mut obj =
            WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let section = obj.section_id(StandardSection::Data);
        let offset = obj.append_section_data(section, &[0u8; 64], 8);
        obj.add_symbol(Symbol {
            name: b"memview_buffer".to_vec(),
            value: offset,
            size: 64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&obj.write().unwrap()).unwrap();
        file.flush().unwrap();

        let (name, address) =
            lookup_symbol(file.path(), &["memview_buffer".to_string()]).unwrap();
        assert_eq!(name, "memview_buffer");
        assert_eq!(address, offset);
    }
}
