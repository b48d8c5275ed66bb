//! Symbolic target to absolute address, done once before sampling.
//!
//! Two strategies: the dynamic symbol table for exported routines, and
//! load base plus a configured offset for everything else. The load base is
//! read from `/proc/self/maps`: the victim maps the same file, and the shared
//! read-only pages are what make its accesses visible here.

use crate::config::TargetSpec;
use cache_side_channel::MonitoredTarget;
use libc::c_void;
use log::{debug, info, warn};
use std::ffi::{CStr, CString};
use std::ops::Range;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use thiserror::Error;

const PROC_MAPS: &str = "/proc/self/maps";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no mapping of {0:?} in the address space")]
    LibraryNotMapped(String),
    #[error("symbol {symbol:?} not exported by {library}")]
    SymbolNotFound { symbol: String, library: PathBuf },
    #[error("cannot load {path}: {reason}")]
    LibraryLoad { path: PathBuf, reason: String },
    #[error("target {0:?} has neither a symbol nor an offset")]
    NoStrategy(String),
    #[error("target {name:?} line at {address:#x} is not in a readable mapping")]
    Unreadable { name: String, address: usize },
    #[error("target {0:?} runs past the top of the address space")]
    AddressOverflow(String),
    #[error("reading /proc/self/maps: {0}")]
    Io(#[from] std::io::Error),
}

fn dlerror_message() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dynamic loader error".to_owned()
    } else {
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}

/// A library kept loaded through the dynamic loader, so that its pages stay
/// mapped for as long as we probe them.
#[derive(Debug)]
pub struct Library {
    handle: NonNull<c_void>,
    path: PathBuf,
}

impl Library {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ResolveError> {
        let path = path.as_ref().to_owned();
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            ResolveError::LibraryLoad {
                path: path.clone(),
                reason: "path contains a NUL byte".to_owned(),
            }
        })?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        match NonNull::new(handle) {
            Some(handle) => {
                debug!("Library handle for {}: {:p}", path.display(), handle);
                Ok(Library { handle, path })
            }
            None => Err(ResolveError::LibraryLoad {
                path,
                reason: dlerror_message(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address of an exported symbol.
    pub fn symbol(&self, symbol: &str) -> Result<usize, ResolveError> {
        let not_found = || ResolveError::SymbolNotFound {
            symbol: symbol.to_owned(),
            library: self.path.clone(),
        };
        let c_symbol = CString::new(symbol).map_err(|_| not_found())?;
        // clear any stale error
        unsafe { libc::dlerror() };
        let address = unsafe { libc::dlsym(self.handle.as_ptr(), c_symbol.as_ptr()) };
        if address.is_null() {
            Err(not_found())
        } else {
            Ok(address as usize)
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        if unsafe { libc::dlclose(self.handle.as_ptr()) } != 0 {
            warn!("dlclose({}): {}", self.path.display(), dlerror_message());
        }
    }
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub offset: usize,
    pub path: Option<String>,
}

impl MapEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let perms = fields.next()?;
        let offset = fields.next()?;
        // device and inode
        fields.next()?;
        fields.next()?;
        let path = fields.collect::<Vec<_>>().join(" ");
        Some(MapEntry {
            start: usize::from_str_radix(start, 16).ok()?,
            end: usize::from_str_radix(end, 16).ok()?,
            readable: perms.starts_with('r'),
            offset: usize::from_str_radix(offset, 16).ok()?,
            path: if path.is_empty() { None } else { Some(path) },
        })
    }

    /// Whether the file name (not the directory) contains `name`. Pseudo
    /// mappings such as `[stack]` never match.
    pub fn file_matches(&self, name: &str) -> bool {
        self.path
            .as_deref()
            .filter(|p| p.starts_with('/'))
            .and_then(|p| p.rsplit('/').next())
            .is_some_and(|file| file.contains(name))
    }

    pub fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }
}

/// Snapshot of the process memory mappings.
#[derive(Debug, Clone, Default)]
pub struct MemoryMaps {
    entries: Vec<MapEntry>,
}

impl MemoryMaps {
    pub fn current() -> Result<Self, ResolveError> {
        Ok(Self::parse(&std::fs::read_to_string(PROC_MAPS)?))
    }

    /// Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        MemoryMaps {
            entries: text.lines().filter_map(MapEntry::parse).collect(),
        }
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    /// Lowest start address among the mappings of the named file.
    pub fn library_base(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .filter(|e| e.file_matches(name))
            .map(|e| e.start)
            .min()
    }

    /// From the load base to the end of the last mapping of the named file.
    pub fn library_range(&self, name: &str) -> Option<Range<usize>> {
        let base = self.library_base(name)?;
        let end = self
            .entries
            .iter()
            .filter(|e| e.file_matches(name))
            .map(|e| e.end)
            .max()?;
        Some(base..end)
    }

    pub fn is_readable(&self, address: usize) -> bool {
        self.entries
            .iter()
            .any(|e| e.readable && e.contains(address))
    }
}

/// Resolves the targets of one library. Owns the library handle: keep the
/// resolver alive until sampling is over.
#[derive(Debug)]
pub struct TargetResolver {
    library: Library,
    map_name: String,
    maps: MemoryMaps,
    base: usize,
}

impl TargetResolver {
    /// Loads `library` and locates its mapping by `map_name`. Fails with
    /// `LibraryNotMapped` when no mapping file name matches.
    pub fn new(library: impl AsRef<Path>, map_name: &str) -> Result<Self, ResolveError> {
        let library = Library::open(library)?;
        let maps = MemoryMaps::current()?;
        let base = maps
            .library_base(map_name)
            .ok_or_else(|| ResolveError::LibraryNotMapped(map_name.to_owned()))?;
        info!(
            "{} mapped at base {:#x}",
            library.path().display(),
            base
        );
        Ok(TargetResolver {
            library,
            map_name: map_name.to_owned(),
            maps,
            base,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn library_range(&self) -> Option<Range<usize>> {
        self.maps.library_range(&self.map_name)
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Address of a symbol of this library. The loader also searches the
    /// dependencies of the handle, so a definition found outside our own
    /// mapping counts as not exported.
    fn exported(&self, symbol: &str) -> Result<usize, ResolveError> {
        let address = self.library.symbol(symbol)?;
        match self.library_range() {
            Some(range) if range.contains(&address) => Ok(address),
            _ => {
                debug!(
                    "{} resolves to {:#x}, outside {}",
                    symbol, address, self.map_name
                );
                Err(ResolveError::SymbolNotFound {
                    symbol: symbol.to_owned(),
                    library: self.library.path().to_owned(),
                })
            }
        }
    }

    fn at_offset(&self, name: &str, offset: usize) -> Result<usize, ResolveError> {
        self.base
            .checked_add(offset)
            .ok_or_else(|| ResolveError::AddressOverflow(name.to_owned()))
    }

    fn address_of(&self, spec: &TargetSpec) -> Result<usize, ResolveError> {
        match (&spec.symbol, spec.offset) {
            (Some(symbol), offset) => match self.exported(symbol) {
                Ok(address) => {
                    info!("{}: symbol {} at {:#x}", spec.name, symbol, address);
                    Ok(address)
                }
                Err(e @ ResolveError::SymbolNotFound { .. }) => match offset {
                    Some(offset) => {
                        warn!(
                            "{}: symbol {} not exported, using base+{:#x}",
                            spec.name, symbol, offset
                        );
                        self.at_offset(&spec.name, offset)
                    }
                    None => Err(e),
                },
                Err(e) => Err(e),
            },
            (None, Some(offset)) => {
                let address = self.at_offset(&spec.name, offset)?;
                info!("{}: base+{:#x} at {:#x}", spec.name, offset, address);
                Ok(address)
            }
            (None, None) => Err(ResolveError::NoStrategy(spec.name.clone())),
        }
    }

    /// Resolves one target and checks every line it covers can be read.
    pub fn resolve(&self, id: usize, spec: &TargetSpec) -> Result<MonitoredTarget, ResolveError> {
        let address = self.address_of(spec)?;
        let target = MonitoredTarget::new(id, spec.name.clone(), address, spec.lines);
        if target.end_address().is_none() {
            return Err(ResolveError::AddressOverflow(spec.name.clone()));
        }
        if let Some(line) = (0..target.lines)
            .map(|line| target.line_address(line))
            .find(|&a| !self.maps.is_readable(a))
        {
            return Err(ResolveError::Unreadable {
                name: spec.name.clone(),
                address: line,
            });
        }
        if target.lines > 1 {
            debug!(
                "{}: {} lines up to {:#x}",
                spec.name,
                target.lines,
                target.line_address(target.lines - 1)
            );
        }
        Ok(target)
    }

    pub fn resolve_all(&self, specs: &[TargetSpec]) -> Result<Vec<MonitoredTarget>, ResolveError> {
        specs
            .iter()
            .enumerate()
            .map(|(id, spec)| self.resolve(id, spec))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Already mapped in every test binary.
    const LIBC: &str = "libc.so.6";

    #[test]
    fn parse_maps() {
        let maps = MemoryMaps::parse(
            "7f2c1a000000-7f2c1a028000 r--p 00000000 08:01 1312 /usr/lib/x86_64-linux-gnu/libgcrypt.so.20.4.1\n\
             7f2c1a028000-7f2c1a0bd000 r-xp 00028000 08:01 1312 /usr/lib/x86_64-linux-gnu/libgcrypt.so.20.4.1\n\
             7f2c1a0bd000-7f2c1a0c0000 ---p 000bd000 08:01 1312 /usr/lib/x86_64-linux-gnu/libgcrypt.so.20.4.1\n\
             7ffd3b7f0000-7ffd3b811000 rw-p 00000000 00:00 0                          [stack]\n\
             garbage\n\
             7f2c19000000-7f2c19001000 rw-p 00000000 00:00 0\n",
        );
        assert_eq!(maps.entries().len(), 5);
        assert_eq!(maps.library_base("libgcrypt.so"), Some(0x7f2c1a000000));
        assert_eq!(
            maps.library_range("libgcrypt.so"),
            Some(0x7f2c1a000000..0x7f2c1a0c0000)
        );
        assert_eq!(maps.entries()[1].offset, 0x28000);
        assert!(maps.is_readable(0x7f2c1a028000 + 0x51470 - 0x28000));
        assert!(!maps.is_readable(0x7f2c1a0bd000));
        // directories do not count as a file name match
        assert_eq!(maps.library_base("x86_64"), None);
        assert_eq!(maps.library_base("stack"), None);
        assert!(maps.entries()[4].path.is_none());
    }

    #[test]
    fn exported_symbol_inside_library() {
        let resolver = TargetResolver::new(LIBC, LIBC).unwrap();
        let target = resolver
            .resolve(0, &TargetSpec::symbol("getpid", "getpid"))
            .unwrap();
        let range = resolver.library_range().unwrap();
        assert!(range.contains(&target.address), "{:#x} {:x?}", target.address, range);
        assert!(resolver.library().symbol("getpid").is_ok());
    }

    #[test]
    fn unknown_symbol() {
        let resolver = TargetResolver::new(LIBC, LIBC).unwrap();
        let err = resolver
            .resolve(0, &TargetSpec::symbol("x", "no_such_symbol_in_libc"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::SymbolNotFound { symbol, .. } if symbol == "no_such_symbol_in_libc"));
    }

    #[test]
    fn unmapped_library() {
        let err = TargetResolver::new(LIBC, "libdefinitely_not_mapped.so").unwrap_err();
        assert!(matches!(err, ResolveError::LibraryNotMapped(name) if name == "libdefinitely_not_mapped.so"));
        assert!(matches!(
            Library::open("/nonexistent/libnothing.so"),
            Err(ResolveError::LibraryLoad { .. })
        ));
    }

    #[test]
    fn offset_fallback_and_offset_only() {
        let resolver = TargetResolver::new(LIBC, LIBC).unwrap();
        let getpid = resolver
            .resolve(0, &TargetSpec::symbol("getpid", "getpid"))
            .unwrap()
            .address;
        let offset = getpid - resolver.base();

        let by_offset = resolver
            .resolve(1, &TargetSpec::offset("getpid", offset))
            .unwrap();
        assert_eq!(by_offset.address, getpid);
        assert_eq!(by_offset.id, 1);

        let fallback = TargetSpec {
            name: "getpid".to_owned(),
            symbol: Some("no_such_symbol_in_libc".to_owned()),
            offset: Some(offset),
            lines: 2,
        };
        let target = resolver.resolve(2, &fallback).unwrap();
        assert_eq!(target.address, getpid);
        assert_eq!(target.lines, 2);

        let neither = TargetSpec {
            symbol: None,
            offset: None,
            ..fallback
        };
        assert!(matches!(
            resolver.resolve(3, &neither),
            Err(ResolveError::NoStrategy(_))
        ));
    }

    #[test]
    fn resolve_all_numbers_targets() {
        let resolver = TargetResolver::new(LIBC, LIBC).unwrap();
        let targets = resolver
            .resolve_all(&[
                TargetSpec::symbol("getpid", "getpid"),
                TargetSpec::symbol("getppid", "getppid"),
            ])
            .unwrap();
        let ids: Vec<_> = targets.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!(resolver
            .resolve_all(&[TargetSpec::symbol("x", "no_such_symbol_in_libc")])
            .is_err());
    }

    #[test]
    fn dependency_symbols_are_not_exported() {
        // libm depends on libc, the loader finds getpid through it
        let resolver = TargetResolver::new("libm.so.6", "libm.so.6").unwrap();
        assert!(resolver.library().symbol("getpid").is_ok());
        let err = resolver
            .resolve(0, &TargetSpec::symbol("getpid", "getpid"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::SymbolNotFound { symbol, .. } if symbol == "getpid"));

        let range = resolver.library_range().unwrap();
        let own = resolver
            .resolve(0, &TargetSpec::symbol("cos", "cos"))
            .unwrap();
        assert!(range.contains(&own.address));

        let fallback = TargetSpec {
            name: "cos".to_owned(),
            symbol: Some("getpid".to_owned()),
            offset: Some(own.address - resolver.base()),
            lines: 1,
        };
        assert_eq!(resolver.resolve(1, &fallback).unwrap().address, own.address);
    }

    #[test]
    fn offsets_past_the_address_space_are_rejected() {
        let resolver = TargetResolver::new(LIBC, LIBC).unwrap();
        assert!(matches!(
            resolver.resolve(0, &TargetSpec::offset("far", usize::MAX - 16)),
            Err(ResolveError::AddressOverflow(name)) if name == "far"
        ));
        // the base fits, the second line does not
        let spec = TargetSpec {
            lines: 2,
            ..TargetSpec::offset("edge", usize::MAX - 16 - resolver.base())
        };
        assert!(matches!(
            resolver.resolve(0, &spec),
            Err(ResolveError::AddressOverflow(_))
        ));
    }

    #[test]
    fn unreadable_offset_rejected() {
        let resolver = TargetResolver::new(LIBC, LIBC).unwrap();
        let range = resolver.library_range().unwrap();
        // far past the end of the library and anything mapped after it
        let offset = (range.end - range.start) + (1 << 40);
        assert!(matches!(
            resolver.resolve(0, &TargetSpec::offset("far", offset)),
            Err(ResolveError::Unreadable { .. })
        ));
    }
}
