//! The `.fjm` binary image container.
//!
//! Byte-exact layout (all integers little-endian):
//!
//! ```text
//! bytes 0..4    magic "FJM\0"
//! bytes 4..6    version (u16), currently 3
//! bytes 6..10   width w (u32)
//! bytes 10..12  flags (u16); bit 0 = zlib-compressed segments
//! bytes 12..16  segment count n (u32)
//! bytes 16..24  reserved, must be zero
//! n * 32 bytes  segment table: start_bit, length_bits, data_offset,
//!               data_length_bytes (u64 each)
//! ...           data blob (per-segment payloads at listed offsets)
//! last 4 bytes  CRC-32 over all preceding bytes
//! ```
//!
//! Segment data is a bit-array laid out LSB-first within each byte.
//! `start_bit` must be a multiple of `w`. A segment whose `length_bits`
//! exceeds its stored bits has a zero-filled tail; bits in no segment at
//! all read as zero.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ImageError;
use crate::{validate_width, FLAG_COMPRESSED, MAGIC, VERSION};

const HEADER_SIZE: usize = 24;
const TABLE_ENTRY_SIZE: usize = 32;
const TRAILER_SIZE: usize = 4;

/// One row of the segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub start_bit: u64,
    pub length_bits: u64,
    pub data_offset: u64,
    pub data_length_bytes: u64,
}

/// A decoded segment: initial memory contents for one contiguous range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start_bit: u64,
    pub length_bits: u64,
    /// Raw (decompressed) bit data, LSB-first within each byte. May
    /// cover fewer bits than `length_bits`; the tail reads as zero.
    pub data: Vec<u8>,
}

impl Segment {
    /// Number of bits actually backed by stored data.
    pub fn data_bits(&self) -> u64 {
        (self.data.len() as u64 * 8).min(self.length_bits)
    }

    pub fn end_bit(&self) -> u64 {
        self.start_bit + self.length_bits
    }
}

/// Compression applied to segment payloads inside the container.
pub trait SegmentCodec {
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, ImageError>;
    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, ImageError>;
}

/// Stores payloads as-is.
pub struct RawCodec;

impl SegmentCodec for RawCodec {
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, ImageError> {
        Ok(raw.to_vec())
    }

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, ImageError> {
        Ok(encoded.to_vec())
    }
}

/// zlib (RFC 1950) deflate, the flag-bit-0 codec.
pub struct ZlibCodec;

impl SegmentCodec for ZlibCodec {
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, ImageError> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(raw)?;
        Ok(encoder.finish()?)
    }

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, ImageError> {
        let mut decoder = flate2::read::ZlibDecoder::new(encoded);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ImageError::Corrupt(format!("bad zlib stream: {}", e)))?;
        Ok(out)
    }
}

/// An assembled FlipJump memory image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub compressed: bool,
    pub segments: Vec<Segment>,
}

impl Image {
    pub fn new(width: u32, compressed: bool) -> Result<Self, ImageError> {
        validate_width(width)?;
        Ok(Image {
            width,
            compressed,
            segments: Vec::new(),
        })
    }

    fn codec(&self) -> Box<dyn SegmentCodec> {
        if self.compressed {
            Box::new(ZlibCodec)
        } else {
            Box::new(RawCodec)
        }
    }

    /// Append a segment, validating alignment, size and overlap.
    pub fn add_segment(
        &mut self,
        start_bit: u64,
        length_bits: u64,
        data: Vec<u8>,
    ) -> Result<(), ImageError> {
        if start_bit % self.width as u64 != 0 {
            return Err(ImageError::MisalignedSegment {
                start_bit,
                width: self.width,
            });
        }
        if data.len() as u64 > (length_bits + 7) / 8 {
            return Err(ImageError::Corrupt(format!(
                "segment at {:#x} holds {} data bytes but spans only {} bits",
                start_bit,
                data.len(),
                length_bits
            )));
        }
        let end_bit = start_bit + length_bits;
        for existing in &self.segments {
            if start_bit < existing.end_bit() && existing.start_bit < end_bit {
                return Err(ImageError::Corrupt(format!(
                    "overlapping segments: [{:#x}, {:#x}) and [{:#x}, {:#x})",
                    existing.start_bit,
                    existing.end_bit(),
                    start_bit,
                    end_bit
                )));
            }
        }
        self.segments.push(Segment {
            start_bit,
            length_bits,
            data,
        });
        Ok(())
    }

    /// Serialize to the byte-exact container format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let codec = self.codec();
        let flags: u16 = if self.compressed { FLAG_COMPRESSED } else { 0 };

        let mut payloads = Vec::with_capacity(self.segments.len());
        let mut table = Vec::with_capacity(self.segments.len());
        let mut offset: u64 = 0;
        for segment in &self.segments {
            let payload = codec.encode(&segment.data)?;
            table.push(SegmentEntry {
                start_bit: segment.start_bit,
                length_bits: segment.length_bits,
                data_offset: offset,
                data_length_bytes: payload.len() as u64,
            });
            offset += payload.len() as u64;
            payloads.push(payload);
        }

        let mut out = Vec::with_capacity(
            HEADER_SIZE + table.len() * TABLE_ENTRY_SIZE + offset as usize + TRAILER_SIZE,
        );
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        for entry in &table {
            out.extend_from_slice(&entry.start_bit.to_le_bytes());
            out.extend_from_slice(&entry.length_bits.to_le_bytes());
            out.extend_from_slice(&entry.data_offset.to_le_bytes());
            out.extend_from_slice(&entry.data_length_bytes.to_le_bytes());
        }
        for payload in &payloads {
            out.extend_from_slice(payload);
        }
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Parse and validate a container.
    pub fn from_bytes(bytes: &[u8]) -> Result<Image, ImageError> {
        if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(ImageError::Corrupt(format!(
                "file too short for a .fjm image ({} bytes)",
                bytes.len()
            )));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_SIZE);
        let stored_crc = u32::from_le_bytes(trailer.try_into().unwrap());
        let actual_crc = crc32fast::hash(body);
        if stored_crc != actual_crc {
            return Err(ImageError::Corrupt(format!(
                "CRC mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, actual_crc
            )));
        }

        if body[0..4] != MAGIC {
            return Err(ImageError::Corrupt("bad magic bytes".to_string()));
        }
        let version = u16::from_le_bytes(body[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let width = u32::from_le_bytes(body[6..10].try_into().unwrap());
        validate_width(width)?;
        let flags = u16::from_le_bytes(body[10..12].try_into().unwrap());
        let segment_count = u32::from_le_bytes(body[12..16].try_into().unwrap()) as usize;
        let reserved = u64::from_le_bytes(body[16..24].try_into().unwrap());
        if reserved != 0 {
            return Err(ImageError::Corrupt(format!(
                "reserved header word is {:#x}, expected 0",
                reserved
            )));
        }

        let table_end = HEADER_SIZE + segment_count * TABLE_ENTRY_SIZE;
        if body.len() < table_end {
            return Err(ImageError::Corrupt(
                "segment table extends past end of file".to_string(),
            ));
        }

        let compressed = flags & FLAG_COMPRESSED != 0;
        let mut image = Image::new(width, compressed)?;
        let codec = image.codec();
        let blob = &body[table_end..];

        for i in 0..segment_count {
            let at = HEADER_SIZE + i * TABLE_ENTRY_SIZE;
            let entry = SegmentEntry {
                start_bit: u64::from_le_bytes(body[at..at + 8].try_into().unwrap()),
                length_bits: u64::from_le_bytes(body[at + 8..at + 16].try_into().unwrap()),
                data_offset: u64::from_le_bytes(body[at + 16..at + 24].try_into().unwrap()),
                data_length_bytes: u64::from_le_bytes(body[at + 24..at + 32].try_into().unwrap()),
            };
            let from = entry.data_offset as usize;
            let to = from + entry.data_length_bytes as usize;
            if to > blob.len() {
                return Err(ImageError::Corrupt(format!(
                    "segment {} payload [{}, {}) exceeds data blob ({} bytes)",
                    i,
                    from,
                    to,
                    blob.len()
                )));
            }
            let data = codec.decode(&blob[from..to])?;
            image.add_segment(entry.start_bit, entry.length_bits, data)?;
        }
        Ok(image)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        Ok(fs::write(path, self.to_bytes()?)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Image, ImageError> {
        Image::from_bytes(&fs::read(path)?)
    }
}

/// Pack `w`-bit words into the image bit layout.
///
/// With `w` a multiple of 8 this is exactly `w/8` little-endian bytes
/// per word (LSB-first bits within LSB-first bytes).
pub fn pack_words(words: &[u64], width: u32) -> Vec<u8> {
    let bytes_per_word = width as usize / 8;
    let mut out = Vec::with_capacity(words.len() * bytes_per_word);
    for &word in words {
        out.extend_from_slice(&word.to_le_bytes()[..bytes_per_word]);
    }
    out
}

/// Inverse of [`pack_words`]; trailing partial words read as zero-padded.
pub fn unpack_words(data: &[u8], width: u32) -> Vec<u64> {
    let bytes_per_word = width as usize / 8;
    data.chunks(bytes_per_word)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            u64::from_le_bytes(raw)
        })
        .collect()
}
