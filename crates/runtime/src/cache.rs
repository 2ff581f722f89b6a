//! On-disk compiled-module cache: serialization format and the consumer
//! interface.
//!
//! The stream layout, little-endian throughout:
//!
//! ```text
//! magic:          6 bytes         ("KSTRL0")
//! version_len:    1 byte
//! version:        <version_len> bytes
//! func_count:     4 bytes
//!   per function: offset (8 bytes; low half the function offset,
//!                 high half the host-entry preamble size)
//! executable_len: 8 bytes
//! executable:     <executable_len> bytes
//! ```
//!
//! A version mismatch marks the entry stale; the engine deletes it and
//! recompiles. The executable image is position-independent, so the bytes
//! can be mapped at any page-aligned base.

use kestrel_environ::ModuleId;

const MAGIC: &[u8; 6] = b"KSTRL0";

/// The engine-side view of a cache entry.
pub(crate) struct CacheEntry {
    pub functions: Vec<CachedFunction>,
    pub executable: Vec<u8>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct CachedFunction {
    pub offset: u32,
    pub preamble_size: u32,
}

/// What deserialization found.
pub(crate) enum Deserialized {
    Ok(CacheEntry),
    /// Valid stream from another runtime version: delete and recompile.
    Stale,
}

/// The minimal storage interface the engine consumes. Implementations are
/// supplied by the embedder; keys are module identity bytes.
pub trait Cache: Send + Sync {
    fn get(&self, key: &ModuleId) -> Option<Vec<u8>>;
    fn add(&self, key: &ModuleId, value: &[u8]);
    fn delete(&self, key: &ModuleId);
}

pub(crate) fn serialize(version: &str, entry: &CacheEntry) -> Vec<u8> {
    let version = version.as_bytes();
    debug_assert!(version.len() < 256);
    let mut out = Vec::with_capacity(
        6 + 1 + version.len() + 4 + entry.functions.len() * 8 + 8 + entry.executable.len(),
    );
    out.extend_from_slice(MAGIC);
    out.push(version.len() as u8);
    out.extend_from_slice(version);
    out.extend_from_slice(&(entry.functions.len() as u32).to_le_bytes());
    for f in &entry.functions {
        let word = u64::from(f.offset) | u64::from(f.preamble_size) << 32;
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.extend_from_slice(&(entry.executable.len() as u64).to_le_bytes());
    out.extend_from_slice(&entry.executable);
    out
}

pub(crate) fn deserialize(version: &str, bytes: &[u8]) -> Result<Deserialized, String> {
    let mut r = Reader { bytes, pos: 0 };
    let magic = r.take(6)?;
    if magic != MAGIC {
        return Err("bad magic".to_string());
    }
    let version_len = r.take(1)?[0] as usize;
    let stored_version = r.take(version_len)?;
    if stored_version != version.as_bytes() {
        return Ok(Deserialized::Stale);
    }
    let func_count = u32::from_le_bytes(r.take(4)?.try_into().unwrap()) as usize;
    let mut functions = Vec::with_capacity(func_count);
    for _ in 0..func_count {
        let word = u64::from_le_bytes(r.take(8)?.try_into().unwrap());
        functions.push(CachedFunction {
            offset: word as u32,
            preamble_size: (word >> 32) as u32,
        });
    }
    let executable_len = u64::from_le_bytes(r.take(8)?.try_into().unwrap()) as usize;
    let executable = r.take(executable_len)?.to_vec();
    Ok(Deserialized::Ok(CacheEntry {
        functions,
        executable,
    }))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.bytes.len() {
            return Err(format!(
                "short read: need {n} bytes at {}, have {}",
                self.pos,
                self.bytes.len() - self.pos
            ));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

/// A process-local in-memory cache, mostly for tests and single-run reuse.
#[derive(Default)]
pub struct InMemoryCache {
    entries: std::sync::Mutex<rustc_hash::FxHashMap<ModuleId, Vec<u8>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &ModuleId) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn add(&self, key: &ModuleId, value: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.clone(), value.to_vec());
    }

    fn delete(&self, key: &ModuleId) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CacheEntry {
        CacheEntry {
            functions: vec![
                CachedFunction {
                    offset: 0,
                    preamble_size: 64,
                },
                CachedFunction {
                    offset: 256,
                    preamble_size: 48,
                },
            ],
            executable: vec![0xAA; 512],
        }
    }

    #[test]
    fn round_trip() {
        let bytes = serialize("1.2.3", &entry());
        match deserialize("1.2.3", &bytes).unwrap() {
            Deserialized::Ok(e) => {
                assert_eq!(e.functions, entry().functions);
                assert_eq!(e.executable, entry().executable);
            }
            Deserialized::Stale => panic!("unexpectedly stale"),
        }
    }

    #[test]
    fn version_mismatch_is_stale() {
        let bytes = serialize("1.2.3", &entry());
        assert!(matches!(
            deserialize("9.9.9", &bytes).unwrap(),
            Deserialized::Stale
        ));
    }

    #[test]
    fn truncation_is_an_error() {
        let bytes = serialize("1.2.3", &entry());
        for cut in [3, 8, 20, bytes.len() - 1] {
            assert!(deserialize("1.2.3", &bytes[..cut]).is_err(), "cut {cut}");
        }
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut bytes = serialize("1.2.3", &entry());
        bytes[0] = b'X';
        assert!(deserialize("1.2.3", &bytes).is_err());
    }
}
