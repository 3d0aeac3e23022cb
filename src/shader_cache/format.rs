//! Binary shader cache file format
//!
//! ```text
//! +-----------+-------------+----------------+-------------+---------------+
//! | Magic(4)  | Format(4)   | Transport(4)   | Checksum(4) | AreaLength(8) |
//! +-----------+-------------+----------------+-------------+---------------+
//! | Effect(8) | Scene(8) | BinaryFormat(4) | Size(4) | Binary(Size) | ...
//! +-----------+----------+-----------------+---------+--------------+
//! ```
//!
//! The checksum is FNV-1a (32 bit) over the record area. All integers are
//! big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CacheError;
use crate::transport::PROTOCOL_VERSION;
use crate::types::SceneId;

/// File magic
pub const CACHE_MAGIC: &[u8; 4] = b"SRSC";

/// Version of the layout described above
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Magic + versions + checksum + area length
pub const CACHE_HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8;

const RECORD_HEADER_SIZE: usize = 8 + 8 + 4 + 4;

/// One cached effect binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderCacheEntry {
    pub effect: u64,
    pub scene: SceneId,
    /// Device-specific binary format tag
    pub format: u32,
    pub binary: Bytes,
}

/// In-memory shader cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderCache {
    entries: Vec<ShaderCacheEntry>,
    transport_version: u32,
}

impl ShaderCache {
    /// Empty cache for the current protocol version
    pub fn new() -> Self {
        Self::for_transport_version(PROTOCOL_VERSION)
    }

    pub fn for_transport_version(transport_version: u32) -> Self {
        Self {
            entries: Vec::new(),
            transport_version,
        }
    }

    /// Add or replace the binary of an effect
    pub fn insert(&mut self, entry: ShaderCacheEntry) {
        match self.entries.iter_mut().find(|e| e.effect == entry.effect) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn get(&self, effect: u64) -> Option<&ShaderCacheEntry> {
        self.entries.iter().find(|e| e.effect == effect)
    }

    pub fn entries(&self) -> &[ShaderCacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize into the file format
    pub fn to_bytes(&self) -> Bytes {
        let mut area = BytesMut::new();
        for entry in &self.entries {
            area.put_u64(entry.effect);
            area.put_u64(entry.scene.0);
            area.put_u32(entry.format);
            area.put_u32(entry.binary.len() as u32);
            area.put_slice(&entry.binary);
        }

        let mut buf = BytesMut::with_capacity(CACHE_HEADER_SIZE + area.len());
        buf.put_slice(CACHE_MAGIC);
        buf.put_u32(CACHE_FORMAT_VERSION);
        buf.put_u32(self.transport_version);
        buf.put_u32(fnv1a(&area));
        buf.put_u64(area.len() as u64);
        buf.put_slice(&area);
        buf.freeze()
    }

    /// Parse and validate a cache file expected to match `transport_version`
    pub fn from_bytes(data: &[u8], transport_version: u32) -> Result<Self, CacheError> {
        if data.len() < CACHE_HEADER_SIZE {
            return Err(CacheError::TooShort(data.len()));
        }

        let mut header = &data[..CACHE_HEADER_SIZE];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if &magic != CACHE_MAGIC {
            return Err(CacheError::BadMagic);
        }

        let format = header.get_u32();
        if format != CACHE_FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                field: "format version",
                expected: CACHE_FORMAT_VERSION,
                found: format,
            });
        }
        let transport = header.get_u32();
        if transport != transport_version {
            return Err(CacheError::VersionMismatch {
                field: "transport version",
                expected: transport_version,
                found: transport,
            });
        }
        let checksum = header.get_u32();
        let declared = header.get_u64();

        let area = &data[CACHE_HEADER_SIZE..];
        let actual = area.len() as u64;
        if actual < declared {
            return Err(CacheError::TooShort(data.len()));
        }
        if actual > declared {
            return Err(CacheError::TooLong((actual - declared) as usize));
        }

        let computed = fnv1a(area);
        if computed != checksum {
            return Err(CacheError::ChecksumMismatch {
                expected: checksum,
                computed,
            });
        }

        let mut cache = Self::for_transport_version(transport_version);
        let mut records = Bytes::copy_from_slice(area);
        while records.has_remaining() {
            if records.remaining() < RECORD_HEADER_SIZE {
                return Err(CacheError::Truncated);
            }
            let effect = records.get_u64();
            let scene = SceneId(records.get_u64());
            let format = records.get_u32();
            let size = records.get_u32() as usize;
            if records.remaining() < size {
                return Err(CacheError::Truncated);
            }
            cache.entries.push(ShaderCacheEntry {
                effect,
                scene,
                format,
                binary: records.split_to(size),
            });
        }
        Ok(cache)
    }
}

/// FNV-1a, 32 bit
pub fn fnv1a(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter()
        .fold(OFFSET, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(PRIME))
}
