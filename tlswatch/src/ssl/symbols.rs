//! TLS entry-point resolution.
//!
//! A `SymbolResolver` turns one on-disk library build into the file offsets
//! the kernel needs for uprobes. Results are all-or-nothing: every required
//! entry point resolves, or the build is rejected.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};

use super::error::ResolveError;

/// Identity of one build of a library: where it is mapped plus a content
/// fingerprint, so a library replaced in place gets a new key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LibraryKey {
    /// Path as mapped inside the process's mount namespace.
    pub path: PathBuf,
    pub dev: u64,
    pub inode: u64,
    pub size: u64,
    pub mtime_ns: i64,
}

impl LibraryKey {
    /// Fingerprint `host_path`, recording it under the namespace path `path`.
    pub fn fingerprint(path: &Path, host_path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(host_path)?;
        Ok(Self {
            path: path.to_path_buf(),
            dev: meta.dev(),
            inode: meta.ino(),
            size: meta.size(),
            mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        })
    }
}

/// A library as seen by one process: its key and a host-visible path to read
/// and attach through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryImage {
    pub key: LibraryKey,
    pub host_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryPoint {
    Read,
    Write,
    Handshake,
    ReadEx,
    WriteEx,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 5] = [
        EntryPoint::Read,
        EntryPoint::Write,
        EntryPoint::Handshake,
        EntryPoint::ReadEx,
        EntryPoint::WriteEx,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            EntryPoint::Read => "SSL_read",
            EntryPoint::Write => "SSL_write",
            EntryPoint::Handshake => "SSL_do_handshake",
            EntryPoint::ReadEx => "SSL_read_ex",
            EntryPoint::WriteEx => "SSL_write_ex",
        }
    }

    /// The `_ex` variants only exist from OpenSSL 1.1.1 on.
    pub fn is_required(self) -> bool {
        matches!(
            self,
            EntryPoint::Read | EntryPoint::Write | EntryPoint::Handshake
        )
    }
}

/// One kernel program to attach at an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSpec {
    pub program: &'static str,
    pub entry_point: EntryPoint,
}

/// Every program installed per library build. Entry and return programs
/// share an offset; the program type decides uprobe vs uretprobe.
pub const SSL_PROBES: &[ProbeSpec] = &[
    ProbeSpec { program: "probe_ssl_rw_enter", entry_point: EntryPoint::Read },
    ProbeSpec { program: "probe_ssl_read_exit", entry_point: EntryPoint::Read },
    ProbeSpec { program: "probe_ssl_rw_enter", entry_point: EntryPoint::Write },
    ProbeSpec { program: "probe_ssl_write_exit", entry_point: EntryPoint::Write },
    ProbeSpec { program: "probe_ssl_do_handshake_enter", entry_point: EntryPoint::Handshake },
    ProbeSpec { program: "probe_ssl_do_handshake_exit", entry_point: EntryPoint::Handshake },
    ProbeSpec { program: "probe_ssl_rw_ex_enter", entry_point: EntryPoint::ReadEx },
    ProbeSpec { program: "probe_ssl_read_ex_exit", entry_point: EntryPoint::ReadEx },
    ProbeSpec { program: "probe_ssl_rw_ex_enter", entry_point: EntryPoint::WriteEx },
    ProbeSpec { program: "probe_ssl_write_ex_exit", entry_point: EntryPoint::WriteEx },
];

/// Distinct program names in `SSL_PROBES`.
pub fn probe_programs() -> BTreeSet<&'static str> {
    SSL_PROBES.iter().map(|p| p.program).collect()
}

/// Resolved file offsets for one library build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslOffsets {
    offsets: BTreeMap<EntryPoint, u64>,
}

impl SslOffsets {
    pub fn insert(&mut self, entry_point: EntryPoint, offset: u64) {
        self.offsets.insert(entry_point, offset);
    }

    pub fn get(&self, entry_point: EntryPoint) -> Option<u64> {
        self.offsets.get(&entry_point).copied()
    }

    pub fn is_complete(&self) -> bool {
        EntryPoint::ALL
            .iter()
            .filter(|ep| ep.is_required())
            .all(|ep| self.offsets.contains_key(ep))
    }
}

/// Strategy for one TLS library family.
pub trait SymbolResolver {
    fn family(&self) -> &'static str;

    fn resolve(&self, image: &LibraryImage) -> Result<SslOffsets, ResolveError>;
}

/// libssl sonames whose ABI the kernel programs understand.
const SUPPORTED_SONAME_VERSIONS: &[&str] = &["1.0", "1.1", "3"];

/// Resolver for OpenSSL's libssl, by ELF symbol table.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpensslResolver;

impl SymbolResolver for OpensslResolver {
    fn family(&self) -> &'static str {
        "openssl"
    }

    fn resolve(&self, image: &LibraryImage) -> Result<SslOffsets, ResolveError> {
        check_soname_version(&image.key.path)?;

        let data = fs::read(&image.host_path)
            .map_err(|e| ResolveError::Transient(format!("read failed: {}", e)))?;
        let elf = object::File::parse(&*data)
            .map_err(|e| ResolveError::Unsupported(format!("not a loadable ELF image: {}", e)))?;

        let mut offsets = SslOffsets::default();
        for ep in EntryPoint::ALL {
            match symbol_file_offset(&elf, ep.symbol()) {
                Some(offset) => offsets.insert(ep, offset),
                None if ep.is_required() => {
                    return Err(ResolveError::Unsupported(format!(
                        "symbol {} not found",
                        ep.symbol()
                    )));
                }
                None => {}
            }
        }

        let current = LibraryKey::fingerprint(&image.key.path, &image.host_path)
            .map_err(|e| ResolveError::Transient(format!("library vanished: {}", e)))?;
        if current != image.key {
            return Err(ResolveError::Transient(
                "library replaced while being parsed".to_string(),
            ));
        }

        Ok(offsets)
    }
}

fn check_soname_version(path: &Path) -> Result<(), ResolveError> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    // Overrides may name arbitrary files; only gate real libssl sonames.
    let Some(version) = name.strip_prefix("libssl.so") else {
        return Ok(());
    };
    let version = version.trim_start_matches('.');
    if version.is_empty() {
        return Ok(());
    }

    let supported = SUPPORTED_SONAME_VERSIONS
        .iter()
        .any(|v| version == *v || version.starts_with(&format!("{}.", v)));
    if supported {
        Ok(())
    } else {
        Err(ResolveError::Unsupported(format!(
            "libssl version {} is not supported",
            version
        )))
    }
}

/// File offset of a defined symbol, as uprobes expect it.
fn symbol_file_offset(elf: &object::File<'_>, name: &str) -> Option<u64> {
    let sym = elf
        .dynamic_symbols()
        .chain(elf.symbols())
        .find(|s| s.is_definition() && s.name() == Ok(name))?;
    let addr = sym.address();

    for segment in elf.segments() {
        let (file_off, file_size) = segment.file_range();
        if addr >= segment.address() && addr < segment.address() + file_size {
            return Some(addr - segment.address() + file_off);
        }
    }

    // Relocatable objects carry no program headers.
    let section = elf.section_by_index(sym.section_index()?).ok()?;
    let (file_off, _) = section.file_range()?;
    Some(addr - section.address() + file_off)
}
