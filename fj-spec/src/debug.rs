//! Debug-info sidecar: the label table and per-op macro stacks.
//!
//! Written next to the image at assemble time and consumed by
//! label-based breakpoints and post-mortem address decoding. The payload
//! is zlib-compressed JSON; the only format contract is that it
//! round-trips.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ImageError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub width: u32,
    /// Fully-qualified label name to bit address.
    pub labels: BTreeMap<String, u64>,
    /// Op bit-address to the rendered macro-invocation chain that
    /// produced it (outermost first). Ops written outside any macro have
    /// no entry.
    pub op_stacks: BTreeMap<u64, Vec<String>>,
}

impl DebugInfo {
    pub fn new(width: u32) -> Self {
        DebugInfo {
            width,
            labels: BTreeMap::new(),
            op_stacks: BTreeMap::new(),
        }
    }

    /// Address-to-label view; when several labels share an address the
    /// lexicographically first wins, so the choice is deterministic.
    pub fn address_to_label(&self) -> BTreeMap<u64, &str> {
        let mut out = BTreeMap::new();
        for (name, &addr) in &self.labels {
            out.entry(addr).or_insert(name.as_str());
        }
        out
    }

    /// The closest label at or before `address`, with its distance.
    pub fn nearest_label(&self, address: u64) -> Option<(&str, u64)> {
        self.address_to_label()
            .range(..=address)
            .next_back()
            .map(|(&addr, &name)| (name, address - addr))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ImageError::Corrupt(format!("debug info serialization: {}", e)))?;
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DebugInfo, ImageError> {
        let mut decoder = flate2::read::ZlibDecoder::new(bytes);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| ImageError::Corrupt(format!("bad debug info stream: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| ImageError::Corrupt(format!("bad debug info payload: {}", e)))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        Ok(fs::write(path, self.to_bytes()?)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<DebugInfo, ImageError> {
        DebugInfo::from_bytes(&fs::read(path)?)
    }
}
