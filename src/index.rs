//! In-memory archive model.
//!
//! Three tables describe everything the scanner learns about an archive:
//!
//! * the fragment table, one row per content-defined fragment, holding its
//!   SHA-1, uncompressed size, and location (`csize`);
//! * the file map, one entry per path, each an append-only list of
//!   versions plus scratch state about the external file during `add` and
//!   extraction progress during `extract`;
//! * the version log, one row per transaction.
//!
//! `csize` of the first fragment of a block is the absolute archive offset
//! of that block; later fragments store the negated position within the
//! block. Two sentinels mark "unknown" and "verified during this run".
//!
//! The dedup map is rebuilt from the fragment table and keys on the first
//! three hash bytes; full-hash confirmation resolves bucket collisions.

use std::collections::BTreeMap;

use crate::attr::FileAttr;

/// `csize` sentinel: fragment id exists but its block is unknown.
pub const HT_BAD: i64 = 0x7FFF_FFFF_FFFF_FFFA;
/// `csize` sentinel: fragment verified during this run.
pub const EXTRACTED: i64 = 0x7FFF_FFFF_FFFF_FFFE;

/// One content-defined fragment.
#[derive(Debug, Clone, Copy)]
pub struct Fragment {
    /// Content hash. All zeros means "hash unknown" (recovered archives).
    pub sha1: [u8; 20],
    /// Uncompressed length, or -1 if unknown (streaming format).
    pub size: i64,
    /// Block offset (first fragment), -position (followers), or sentinel.
    pub csize: i64,
}

impl Fragment {
    /// A placeholder row with no known location.
    pub fn unknown() -> Fragment {
        Fragment {
            sha1: [0; 20],
            size: -1,
            csize: HT_BAD,
        }
    }

    /// A fully known row.
    pub fn new(sha1: [u8; 20], size: i64, csize: i64) -> Fragment {
        Fragment { sha1, size, csize }
    }

    /// True if the stored hash is usable for verification.
    pub fn has_hash(&self) -> bool {
        self.sha1.iter().any(|&b| b != 0)
    }
}

/// One stored version of one file.
#[derive(Debug, Clone, Default)]
pub struct FileVersion {
    /// Index into the version log.
    pub version: u32,
    /// Modification date, 0 = deletion marker.
    pub date: i64,
    /// Total size in bytes, or -1 if any fragment size is unknown.
    pub size: i64,
    /// Platform attributes.
    pub attr: FileAttr,
    /// Ordered fragment ids.
    pub frags: Vec<u32>,
}

/// Extraction progress marker: entry not selected by the arguments.
pub const NOT_SELECTED: i64 = -1;

/// One path in the file map.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Versions in scan order (append-only).
    pub versions: Vec<FileVersion>,
    /// External file date during `add` (0 = does not exist).
    pub ext_date: i64,
    /// External file size during `add`.
    pub ext_size: i64,
    /// External file attributes during `add`.
    pub ext_attr: FileAttr,
    /// Fragment list being built for the external file.
    pub new_frags: Vec<u32>,
    /// Fragments written so far during extract; [`NOT_SELECTED`] if the
    /// entry is not part of the current operation.
    pub written: i64,
}

impl Default for FileEntry {
    fn default() -> FileEntry {
        FileEntry {
            versions: Vec::new(),
            ext_date: 0,
            ext_size: 0,
            ext_attr: FileAttr::None,
            new_frags: Vec::new(),
            written: NOT_SELECTED,
        }
    }
}

impl FileEntry {
    /// The most recent version, if any.
    pub fn latest(&self) -> Option<&FileVersion> {
        self.versions.last()
    }

    /// True if the path exists (is not deleted) in the latest version.
    pub fn is_live(&self) -> bool {
        self.latest().map_or(false, |v| v.date != 0)
    }

    /// True if the entry was selected by the command arguments.
    pub fn selected(&self) -> bool {
        self.written >= 0
    }
}

/// One transaction in the version log.
#[derive(Debug, Clone, Default)]
pub struct Version {
    /// Transaction date.
    pub date: i64,
    /// Archive offset of the transaction header block.
    pub offset: i64,
    /// Total uncompressed bytes referenced by this version's file rows.
    pub bytes: i64,
    /// File additions or updates recorded.
    pub updates: u32,
    /// File deletions recorded.
    pub deletes: u32,
    /// Lowest fragment id introduced by this version.
    pub first_fragment: u32,
}

/// The complete in-memory model of one archive.
#[derive(Debug, Default)]
pub struct ArchiveIndex {
    /// Fragment table; index 0 is reserved and unused.
    pub fragments: Vec<Fragment>,
    /// File map, ordered by path (byte order).
    pub files: BTreeMap<String, FileEntry>,
    /// Version log; index 0 is reserved and unused.
    pub versions: Vec<Version>,
}

impl ArchiveIndex {
    /// An empty model with the reserved zero rows in place.
    pub fn new() -> ArchiveIndex {
        ArchiveIndex {
            fragments: vec![Fragment::unknown()],
            files: BTreeMap::new(),
            versions: vec![Version::default()],
        }
    }

    /// Number of real fragments (excluding the reserved row).
    pub fn fragment_count(&self) -> usize {
        self.fragments.len() - 1
    }

    /// Marks entries matching the selection arguments with `written = 0`.
    ///
    /// An empty pattern list selects everything. `exclude` patterns win
    /// over includes. Unless `with_deleted` is set, only paths live in
    /// their latest version are selected.
    pub fn select(&mut self, patterns: &[String], exclude: &[String], with_deleted: bool) {
        for (name, entry) in self.files.iter_mut() {
            let mut matched =
                patterns.is_empty() || patterns.iter().any(|p| crate::path::is_prefix(p, name));
            if matched && exclude.iter().any(|p| crate::path::is_prefix(p, name)) {
                matched = false;
            }
            if matched && (with_deleted || entry.is_live()) {
                entry.written = 0;
            }
        }
    }
}

/// Fragment lookup by content hash.
///
/// Buckets are keyed by the first three hash bytes; each bucket lists the
/// fragment ids whose full hash must then be compared. Only fragments with
/// a known size are indexed; unknown-size rows come from the streaming
/// format and are not candidates for reuse.
pub struct DedupIndex {
    buckets: Vec<Vec<u32>>,
    indexed: usize,
}

const BUCKET_COUNT: usize = 1 << 22;

impl DedupIndex {
    /// Builds the map over the current fragment table.
    pub fn build(fragments: &[Fragment]) -> DedupIndex {
        let mut map = DedupIndex {
            buckets: vec![Vec::new(); BUCKET_COUNT],
            indexed: 1,
        };
        map.update(fragments);
        map
    }

    fn bucket_of(sha1: &[u8; 20]) -> usize {
        (sha1[0] as usize | (sha1[1] as usize) << 8 | (sha1[2] as usize) << 16)
            & (BUCKET_COUNT - 1)
    }

    /// Indexes fragment rows appended since the last call.
    pub fn update(&mut self, fragments: &[Fragment]) {
        while self.indexed < fragments.len() {
            let f = &fragments[self.indexed];
            if f.size >= 0 {
                self.buckets[Self::bucket_of(&f.sha1)].push(self.indexed as u32);
            }
            self.indexed += 1;
        }
    }

    /// Finds the fragment id with the given hash, or 0 if unseen.
    pub fn find(&self, sha1: &[u8; 20], fragments: &[Fragment]) -> u32 {
        for &id in &self.buckets[Self::bucket_of(sha1)] {
            if &fragments[id as usize].sha1 == sha1 {
                return id;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(b: u8) -> Fragment {
        Fragment::new([b; 20], 100, 0)
    }

    #[test]
    fn dedup_finds_only_known_sizes() {
        let mut frags = vec![Fragment::unknown(), frag(1), frag(2)];
        frags.push(Fragment::new([3; 20], -1, 0)); // streaming row
        let map = DedupIndex::build(&frags);
        assert_eq!(map.find(&[1; 20], &frags), 1);
        assert_eq!(map.find(&[2; 20], &frags), 2);
        assert_eq!(map.find(&[3; 20], &frags), 0);
        assert_eq!(map.find(&[9; 20], &frags), 0);
    }

    #[test]
    fn dedup_update_is_incremental() {
        let mut frags = vec![Fragment::unknown(), frag(1)];
        let mut map = DedupIndex::build(&frags);
        frags.push(frag(2));
        assert_eq!(map.find(&[2; 20], &frags), 0);
        map.update(&frags);
        assert_eq!(map.find(&[2; 20], &frags), 2);
    }

    #[test]
    fn bucket_collisions_resolved_by_full_hash() {
        // Same first three bytes, different tails.
        let mut a = [5u8; 20];
        let mut b = [5u8; 20];
        a[19] = 1;
        b[19] = 2;
        let frags = vec![
            Fragment::unknown(),
            Fragment::new(a, 10, 0),
            Fragment::new(b, 10, 0),
        ];
        let map = DedupIndex::build(&frags);
        assert_eq!(map.find(&a, &frags), 1);
        assert_eq!(map.find(&b, &frags), 2);
    }

    #[test]
    fn selection_respects_patterns_and_deleted() {
        let mut idx = ArchiveIndex::new();
        for (name, date) in [("a/x", 1i64), ("a/y", 0), ("b/z", 1)] {
            let entry = idx.files.entry(name.to_string()).or_default();
            entry.written = NOT_SELECTED;
            entry.versions.push(FileVersion {
                date: if date == 0 { 0 } else { 20240101000000 },
                ..FileVersion::default()
            });
        }
        idx.select(&["a".into()], &[], false);
        assert!(idx.files["a/x"].selected());
        assert!(!idx.files["a/y"].selected()); // deleted
        assert!(!idx.files["b/z"].selected()); // not matched

        let mut idx2 = ArchiveIndex::new();
        for name in ["a/x", "a/y"] {
            let entry = idx2.files.entry(name.to_string()).or_default();
            entry.written = NOT_SELECTED;
            entry.versions.push(FileVersion {
                date: 20240101000000,
                ..FileVersion::default()
            });
        }
        idx2.select(&[], &["a/y".into()], false);
        assert!(idx2.files["a/x"].selected());
        assert!(!idx2.files["a/y"].selected());
    }
}
