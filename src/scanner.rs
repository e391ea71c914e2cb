// Thu Feb 5 2026 - Alex

//! Byte-pattern candidate discovery. Structure searches derive a pattern
//! from the most selective field they know (a fixed signature, or the
//! encoded offset of an already-built referent), scan the data sections for
//! it, then subtract the field's offset to get a candidate structure start.
//!
//! Pointer-derived patterns are tail patterns: the low `shift` bytes of the
//! encoded value are stripped so nearby referents collapse into one scan
//! pass, and every hit re-reads the full field to confirm which referent it
//! actually was.

use crate::arch::TargetArch;
use crate::codec::OffsetCodec;
use crate::memory::{data_sections, is_data_address, Address, AddressRange, ByteImage};
use indexmap::IndexMap;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared between the caller and long scans.
/// Checked at chunk granularity, never mid-structure-decode.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a pattern's hits are confirmed against the field they matched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// Fixed signature bytes; the match itself is the confirmation.
    Signature,
    /// Codec-encoded offset field referencing a known target.
    Offset,
    /// Raw pointer-width field referencing a known target.
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub bytes: Vec<u8>,
    /// Leading bytes of the encoded value stripped off before scanning.
    pub shift: usize,
    pub kind: PatternKind,
}

#[derive(Debug)]
pub struct PatternEntry {
    pub pattern: Pattern,
    /// Referents whose encodings share this tail. Empty for signature
    /// patterns that need no referent confirmation.
    pub keys: Vec<Address>,
}

/// Deduplicated set of patterns scanned in one pass.
#[derive(Debug, Default)]
pub struct PatternSet {
    entries: IndexMap<Pattern, Vec<Address>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_signature(&mut self, bytes: Vec<u8>) {
        self.entries
            .entry(Pattern { bytes, shift: 0, kind: PatternKind::Signature })
            .or_default();
    }

    /// Tail pattern for a codec-encoded offset referencing `target`.
    pub fn add_target(
        &mut self,
        target: Address,
        codec: &OffsetCodec,
        arch: TargetArch,
        shift: usize,
    ) {
        let encoded = codec.encoded_bytes(target, arch);
        self.entries
            .entry(Pattern {
                bytes: encoded[shift..].to_vec(),
                shift,
                kind: PatternKind::Offset,
            })
            .or_default()
            .push(target);
    }

    /// Tail pattern for a raw pointer to `target`. Pointer fields stay
    /// pointer-width even on targets whose offsets are image-relative.
    pub fn add_pointer_target(&mut self, target: Address, arch: TargetArch, shift: usize) {
        let encoded =
            crate::arch::uint_bytes(target.as_u64(), arch.pointer_size(), arch.endianness());
        self.entries
            .entry(Pattern {
                bytes: encoded[shift..].to_vec(),
                shift,
                kind: PatternKind::Pointer,
            })
            .or_default()
            .push(target);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> Vec<PatternEntry> {
        self.entries
            .iter()
            .map(|(pattern, keys)| PatternEntry { pattern: pattern.clone(), keys: keys.clone() })
            .collect()
    }

    fn max_pattern_len(&self) -> usize {
        self.entries.keys().map(|p| p.bytes.len()).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanMatch {
    /// Address of the first pattern byte.
    pub address: Address,
    /// Index into the deduplicated entry list.
    pub entry: usize,
}

pub type ProgressFn = dyn Fn(usize, usize) -> bool + Send + Sync;

/// Exact byte-pattern search over address ranges, chunked and parallel.
/// Matches from all chunks funnel into one ordered merge before anything
/// validates them.
pub struct PatternScanner {
    chunk_size: usize,
    progress: Option<Box<ProgressFn>>,
}

impl Default for PatternScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternScanner {
    pub const DEFAULT_CHUNK_SIZE: usize = 0x10000;

    pub fn new() -> Self {
        Self { chunk_size: Self::DEFAULT_CHUNK_SIZE, progress: None }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Progress callback `(chunks_done, chunks_total) -> continue`. A false
    /// return stops the scan like a cancellation.
    pub fn with_progress(mut self, progress: Box<ProgressFn>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Scans one range for every pattern in the set. Already-found matches
    /// survive cancellation.
    pub fn scan_range(
        &self,
        image: &dyn ByteImage,
        range: AddressRange,
        set: &PatternSet,
        cancel: &CancelToken,
    ) -> Vec<ScanMatch> {
        if set.is_empty() || range.is_empty() {
            return Vec::new();
        }
        let buffer = match image.read_bytes(range.start, range.size() as usize) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::debug!("scan skipped unreadable range {}: {}", range.start, e);
                return Vec::new();
            }
        };

        let entries = set.entries();
        let overlap = set.max_pattern_len().saturating_sub(1);
        let chunk_starts: Vec<usize> = (0..buffer.len()).step_by(self.chunk_size).collect();
        let total = chunk_starts.len();
        let done = AtomicUsize::new(0);

        let mut matches: Vec<(usize, usize)> = chunk_starts
            .par_iter()
            .map(|&start| {
                if cancel.is_cancelled() {
                    return Vec::new();
                }
                let end = (start + self.chunk_size + overlap).min(buffer.len());
                let found = Self::search_chunk(&buffer[start..end], start, &entries);
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(progress) = &self.progress {
                    if !progress(n, total) {
                        cancel.cancel();
                    }
                }
                found
            })
            .flatten()
            .collect();

        // Overlap regions can report a hit from two chunks.
        matches.sort_unstable();
        matches.dedup();
        matches
            .into_iter()
            .map(|(offset, entry)| ScanMatch { address: range.start + offset as u64, entry })
            .collect()
    }

    /// Scans all data sections, in section order.
    pub fn scan_data_sections(
        &self,
        image: &dyn ByteImage,
        set: &PatternSet,
        cancel: &CancelToken,
    ) -> Vec<ScanMatch> {
        let mut out = Vec::new();
        for section in data_sections(image) {
            if cancel.is_cancelled() {
                break;
            }
            out.extend(self.scan_range(image, section.range, set, cancel));
        }
        out
    }

    fn search_chunk(
        chunk: &[u8],
        chunk_offset: usize,
        entries: &[PatternEntry],
    ) -> Vec<(usize, usize)> {
        let mut found = Vec::new();
        for (entry_idx, entry) in entries.iter().enumerate() {
            let pattern = &entry.pattern.bytes;
            if pattern.is_empty() || pattern.len() > chunk.len() {
                continue;
            }
            let first = pattern[0];
            for i in 0..=chunk.len() - pattern.len() {
                if chunk[i] == first && &chunk[i..i + pattern.len()] == pattern.as_slice() {
                    found.push((chunk_offset + i, entry_idx));
                }
            }
        }
        found
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Candidate structure start.
    pub address: Address,
    /// Referent whose encoded offset produced the hit, when the pattern set
    /// was built from targets.
    pub key: Option<Address>,
}

/// Turns raw pattern matches into aligned candidate structure starts by
/// rewinding the pattern shift and the searched field's offset.
pub struct CandidateScanner<'a> {
    image: &'a dyn ByteImage,
    codec: OffsetCodec,
    scanner: &'a PatternScanner,
}

impl<'a> CandidateScanner<'a> {
    pub fn new(image: &'a dyn ByteImage, codec: OffsetCodec, scanner: &'a PatternScanner) -> Self {
        Self { image, codec, scanner }
    }

    /// Scans the data sections and yields candidate starts, candidates with
    /// a hit field that does not decode back to a set key are dropped.
    pub fn candidates(
        &self,
        set: &PatternSet,
        field_offset: usize,
        alignment: u64,
        cancel: &CancelToken,
    ) -> Vec<Candidate> {
        let matches = self.scanner.scan_data_sections(self.image, set, cancel);
        let entries = set.entries();
        let mut seen = ahash::AHashSet::new();
        let mut out = Vec::new();

        for hit in matches {
            let entry = &entries[hit.entry];
            let Some(field_start) = hit.address.checked_sub(entry.pattern.shift as u64) else {
                continue;
            };

            // Tail patterns collide; confirm the full field value.
            let key = match entry.pattern.kind {
                PatternKind::Signature => None,
                PatternKind::Offset => {
                    let Ok(raw) = self.read_offset_value(field_start) else {
                        continue;
                    };
                    let resolved = self.codec.resolve(raw);
                    if !entry.keys.contains(&resolved) {
                        continue;
                    }
                    Some(resolved)
                }
                PatternKind::Pointer => {
                    let Ok(target) = self.image.read_ptr(field_start) else {
                        continue;
                    };
                    if !entry.keys.contains(&target) {
                        continue;
                    }
                    Some(target)
                }
            };

            let Some(start) = field_start.checked_sub(field_offset as u64) else {
                continue;
            };
            if !start.is_aligned(alignment) {
                continue;
            }
            if !is_data_address(self.image, start) {
                continue;
            }
            if seen.insert(start) {
                out.push(Candidate { address: start, key });
            }
        }
        out
    }

    fn read_offset_value(&self, addr: Address) -> Result<u64, crate::memory::MemoryError> {
        match self.codec {
            OffsetCodec::Absolute { .. } => Ok(self.image.read_ptr(addr)?.as_u64()),
            OffsetCodec::ImageRelative { .. } => Ok(self.image.read_u32(addr)? as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{OwnedImage, SectionSemantics};

    fn image_with(bytes: &[u8]) -> OwnedImage {
        let mut builder = OwnedImage::builder(Address::new(0x140000000), TargetArch::X64)
            .section(
                ".rdata",
                AddressRange::with_size(Address::new(0x140001000), 0x1000),
                SectionSemantics::ReadOnlyData,
            );
        builder.write_bytes(Address::new(0x140001000), bytes);
        builder.build()
    }

    #[test]
    fn test_signature_scan() {
        let mut bytes = vec![0u8; 0x200];
        bytes[0x10..0x13].copy_from_slice(b".?A");
        bytes[0x80..0x83].copy_from_slice(b".?A");
        let image = image_with(&bytes);

        let mut set = PatternSet::new();
        set.add_signature(b".?A".to_vec());
        let scanner = PatternScanner::new().with_chunk_size(0x40);
        let matches = scanner.scan_data_sections(&image, &set, &CancelToken::new());

        let addrs: Vec<Address> = matches.iter().map(|m| m.address).collect();
        assert_eq!(
            addrs,
            vec![Address::new(0x140001010), Address::new(0x140001080)]
        );
    }

    #[test]
    fn test_match_straddling_chunk_boundary() {
        let mut bytes = vec![0u8; 0x100];
        // Sits across the 0x40 chunk edge.
        bytes[0x3e..0x42].copy_from_slice(b"ABCD");
        let image = image_with(&bytes);

        let mut set = PatternSet::new();
        set.add_signature(b"ABCD".to_vec());
        let scanner = PatternScanner::new().with_chunk_size(0x40);
        let matches = scanner.scan_data_sections(&image, &set, &CancelToken::new());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].address, Address::new(0x14000103e));
    }

    #[test]
    fn test_tail_pattern_confirms_full_value() {
        let codec = OffsetCodec::for_target(TargetArch::X64, Address::new(0x140000000));
        let target = Address::new(0x140330020);
        let decoy = Address::new(0x140330040); // same 2-byte tail, different low bytes

        let mut bytes = vec![0xccu8; 0x100];
        bytes[0x20..0x24].copy_from_slice(&codec.encoded_bytes(target, TargetArch::X64));
        bytes[0x40..0x44].copy_from_slice(&codec.encoded_bytes(decoy, TargetArch::X64));
        let image = image_with(&bytes);

        let mut set = PatternSet::new();
        set.add_target(target, &codec, TargetArch::X64, 2);
        let scanner = PatternScanner::new();
        let candidates = CandidateScanner::new(&image, codec, &scanner).candidates(
            &set,
            0x20,
            4,
            &CancelToken::new(),
        );

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address, Address::new(0x140001000));
        assert_eq!(candidates[0].key, Some(target));
    }

    #[test]
    fn test_cancel_preserves_found() {
        let mut bytes = vec![0u8; 0x400];
        bytes[0x10..0x13].copy_from_slice(b".?A");
        let image = image_with(&bytes);

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut set = PatternSet::new();
        set.add_signature(b".?A".to_vec());
        let matches = PatternScanner::new().scan_data_sections(&image, &set, &cancel);
        assert!(matches.is_empty());
    }
}
