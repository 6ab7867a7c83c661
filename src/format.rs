//! On-disk journal structures.
//!
//! An archive is a concatenation of ZPAQ blocks. Journaling blocks carry a
//! 28-character segment filename `jDC<date:14><kind><id:10>` and a comment
//! ending in the tag bytes `jDC\x01`; the comment's leading decimal number
//! is the uncompressed payload size. Four block kinds exist:
//!
//! | kind | payload |
//! |------|---------|
//! | `c` | 8-byte LE jump to the first byte after the transaction |
//! | `d` | fragment bytes, then `sizes[k]·4, firstId·4, k·4` (robust mode) |
//! | `h` | `bsize·4` then `(sha1[20], size·4)` per fragment |
//! | `i` | repeating `(date·8, name, 0, [na·4 attr[na] ni·4 ptr[ni]·4])` |
//!
//! Anything else is a streaming-format segment whose filename/comment carry
//! the file metadata directly. All integers are little-endian.

use crate::attr::FileAttr;
use crate::error::{Error, Result};

/// Comment suffix marking a journaling segment.
pub const JOURNAL_TAG: &[u8] = b" jDC\x01";

/// Kind letter of a journaling block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Transaction header.
    Header,
    /// Fragment data.
    Data,
    /// Fragment table.
    FragTable,
    /// File index.
    Index,
}

impl BlockKind {
    fn from_char(c: u8) -> Option<BlockKind> {
        match c {
            b'c' => Some(BlockKind::Header),
            b'd' => Some(BlockKind::Data),
            b'h' => Some(BlockKind::FragTable),
            b'i' => Some(BlockKind::Index),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            BlockKind::Header => 'c',
            BlockKind::Data => 'd',
            BlockKind::FragTable => 'h',
            BlockKind::Index => 'i',
        }
    }
}

/// Parsed journaling segment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentName {
    /// Transaction date of the version that wrote the block.
    pub date: i64,
    /// Block kind.
    pub kind: BlockKind,
    /// Kind-specific id: first fragment id for `d`/`h`, running count for
    /// `c` (fragment table size) and `i`.
    pub id: u32,
}

impl SegmentName {
    /// Formats the 28-character segment filename.
    pub fn format(&self) -> String {
        format!("jDC{:014}{}{:010}", self.date, self.kind.as_char(), self.id)
    }

    /// Parses a segment filename, if it has the journaling shape.
    pub fn parse(name: &str) -> Option<SegmentName> {
        let b = name.as_bytes();
        if b.len() != 28 || &b[0..3] != b"jDC" {
            return None;
        }
        let kind = BlockKind::from_char(b[17])?;
        let date: i64 = name[3..17].parse().ok()?;
        let id: u32 = name[18..28].parse().ok()?;
        Some(SegmentName { date, kind, id })
    }
}

/// Builds the comment for a journaling segment of `usize` payload bytes.
pub fn journal_comment(usize: usize) -> String {
    let mut s = usize.to_string();
    s.push_str(std::str::from_utf8(JOURNAL_TAG).expect("ascii tag"));
    s
}

/// True if a segment comment carries the journaling tag.
pub fn has_journal_tag(comment: &[u8]) -> bool {
    comment.len() >= 4 && &comment[comment.len() - 4..] == &JOURNAL_TAG[1..]
}

/// Metadata parsed from a streaming-format segment comment
/// (`"<size> YYYYMMDDHHMMSS [u|w]N"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingComment {
    /// Uncompressed segment size, or -1 if absent.
    pub size: i64,
    /// Decimal date, or -1 if absent or out of range.
    pub date: i64,
    /// Attributes, if present.
    pub attr: FileAttr,
}

/// Parses a streaming segment comment. Never fails; missing pieces come
/// back as -1 / [`FileAttr::None`].
pub fn parse_streaming_comment(comment: &[u8]) -> StreamingComment {
    let mut i = 0;
    let mut size: i64 = 0;
    let mut any = false;
    while i < comment.len() && comment[i].is_ascii_digit() {
        size = size * 10 + i64::from(comment[i] - b'0');
        any = true;
        i += 1;
    }
    if !any {
        size = -1;
    }
    let mut date: i64 = 0;
    while i < comment.len() && date < crate::date::MIN_DATE {
        if comment[i].is_ascii_digit() {
            date = date * 10 + i64::from(comment[i] - b'0');
        }
        i += 1;
    }
    if !crate::date::is_valid(date) {
        date = -1;
    }
    // Attribute: a 'u' or 'w' immediately followed by a decimal number.
    let mut attr_char = 0u8;
    let mut attr_num: i64 = 0;
    let mut raw: i64 = 0;
    for &c in &comment[..] {
        if c == b'u' || c == b'w' {
            attr_char = c;
            attr_num = 0;
        } else if c.is_ascii_digit() && attr_char != 0 {
            attr_num = attr_num * 10 + i64::from(c - b'0');
        } else if attr_char != 0 {
            raw = attr_num * 256 + i64::from(attr_char);
            attr_char = 0;
        }
    }
    if attr_char != 0 {
        raw = attr_num * 256 + i64::from(attr_char);
    }
    StreamingComment {
        size,
        date,
        attr: FileAttr::from_raw(raw),
    }
}

/// Builds a streaming segment comment from file metadata.
pub fn streaming_comment(size: u64, date: i64, attr: FileAttr) -> String {
    let mut s = format!("{size} {date}");
    match attr {
        FileAttr::None => {}
        FileAttr::Unix(mode) => s.push_str(&format!(" u{mode}")),
        FileAttr::Windows(flags) => s.push_str(&format!(" w{flags}")),
    }
    s
}

/// Little-endian read cursor over a block payload.
///
/// Truncation surfaces as [`Error::Format`] so the scan loop can charge it
/// to the block being read.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Wraps a payload.
    pub fn new(data: &'a [u8]) -> Self {
        PayloadReader { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Reads a 32-bit little-endian integer.
    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a 64-bit little-endian integer.
    pub fn i64(&mut self) -> Result<i64> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::format("truncated block payload"));
        }
        let b = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(b)
    }

    /// Reads a NUL-terminated string (the NUL is consumed).
    pub fn cstr(&mut self) -> Result<&'a str> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&c| c == 0)
            .ok_or_else(|| Error::format("unterminated name in index block"))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|_| Error::format("non-UTF-8 name in index block"))?;
        self.pos += end + 1;
        Ok(s)
    }
}

/// One file row decoded from an index (`i`) block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    /// File name (forward slashes).
    pub name: String,
    /// Modification date, 0 for a deletion marker.
    pub date: i64,
    /// Attributes.
    pub attr: FileAttr,
    /// Fragment pointer list (empty for deletions).
    pub frags: Vec<u32>,
}

/// Appends one row to an index block payload.
pub fn write_index_row(out: &mut Vec<u8>, row: &IndexRow) {
    out.extend_from_slice(&row.date.to_le_bytes());
    out.extend_from_slice(row.name.as_bytes());
    out.push(0);
    if row.date != 0 {
        out.extend_from_slice(&row.attr.to_index_bytes());
        out.extend_from_slice(&(row.frags.len() as u32).to_le_bytes());
        for &p in &row.frags {
            out.extend_from_slice(&p.to_le_bytes());
        }
    }
}

/// Decodes every row of an index block payload.
///
/// Rows are tolerated up to the first truncation, matching the scanner's
/// read-what-you-can behavior; a fragment pointer of zero is invalid and
/// rejected here, but range checks against the fragment table are the
/// caller's.
pub fn read_index_rows(payload: &[u8]) -> Result<Vec<IndexRow>> {
    let mut r = PayloadReader::new(payload);
    let mut rows = Vec::new();
    while r.remaining() >= 9 {
        let date = r.i64()?;
        let name = r.cstr()?.to_string();
        let mut row = IndexRow {
            name,
            date,
            attr: FileAttr::None,
            frags: Vec::new(),
        };
        if date != 0 {
            if r.remaining() < 8 {
                break;
            }
            let na = r.u32()? as usize;
            row.attr = FileAttr::from_index_bytes(r.bytes(na.min(r.remaining()))?);
            if r.remaining() < 4 {
                break;
            }
            let ni = r.u32()? as usize;
            row.frags.reserve(ni.min(r.remaining() / 4));
            for _ in 0..ni {
                if r.remaining() < 4 {
                    break;
                }
                let p = r.u32()?;
                if p == 0 {
                    return Err(Error::format("fragment pointer 0 in index block"));
                }
                row.frags.push(p);
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// One fragment record of a fragment-table (`h`) block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragRecord {
    /// Content hash.
    pub sha1: [u8; 20],
    /// Uncompressed size.
    pub size: u32,
}

/// Encodes a fragment-table payload: the compressed size of the matching
/// data block, then one record per fragment.
pub fn write_frag_table(out: &mut Vec<u8>, bsize: u32, records: &[FragRecord]) {
    out.extend_from_slice(&bsize.to_le_bytes());
    for rec in records {
        out.extend_from_slice(&rec.sha1);
        out.extend_from_slice(&rec.size.to_le_bytes());
    }
}

/// Decodes a fragment-table payload.
pub fn read_frag_table(payload: &[u8]) -> Result<(u32, Vec<FragRecord>)> {
    let mut r = PayloadReader::new(payload);
    let bsize = r.u32()?;
    let n = r.remaining() / 24;
    let mut records = Vec::with_capacity(n);
    for _ in 0..n {
        let mut sha1 = [0u8; 20];
        sha1.copy_from_slice(r.bytes(20)?);
        let size = r.u32()?;
        records.push(FragRecord { sha1, size });
    }
    Ok((bsize, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_roundtrip() {
        let n = SegmentName {
            date: 20240229153000,
            kind: BlockKind::Data,
            id: 1,
        };
        let s = n.format();
        assert_eq!(s, "jDC20240229153000d0000000001");
        assert_eq!(s.len(), 28);
        assert_eq!(SegmentName::parse(&s), Some(n));
        assert_eq!(SegmentName::parse("jDC20240229153000z0000000001"), None);
        assert_eq!(SegmentName::parse("readme.txt"), None);
    }

    #[test]
    fn journal_comment_tag() {
        let c = journal_comment(512);
        assert!(c.starts_with("512"));
        assert!(has_journal_tag(c.as_bytes()));
        assert!(!has_journal_tag(b"100 20240101000000"));
    }

    #[test]
    fn streaming_comment_roundtrip() {
        let c = streaming_comment(1234, 20240229153000, FileAttr::Unix(0o644));
        let p = parse_streaming_comment(c.as_bytes());
        assert_eq!(p.size, 1234);
        assert_eq!(p.date, 20240229153000);
        assert_eq!(p.attr, FileAttr::Unix(0o644));

        let p = parse_streaming_comment(b"77");
        assert_eq!(p.size, 77);
        assert_eq!(p.date, -1);
        assert_eq!(p.attr, FileAttr::None);
    }

    #[test]
    fn index_rows_roundtrip() {
        let rows = vec![
            IndexRow {
                name: "a/b.txt".into(),
                date: 20240101120000,
                attr: FileAttr::Unix(0o644),
                frags: vec![1, 2, 3],
            },
            IndexRow {
                name: "gone.txt".into(),
                date: 0,
                attr: FileAttr::None,
                frags: vec![],
            },
        ];
        let mut buf = Vec::new();
        for row in &rows {
            write_index_row(&mut buf, row);
        }
        assert_eq!(read_index_rows(&buf).unwrap(), rows);
    }

    #[test]
    fn index_rejects_zero_pointer() {
        let row = IndexRow {
            name: "x".into(),
            date: 20240101120000,
            attr: FileAttr::None,
            frags: vec![1],
        };
        let mut buf = Vec::new();
        write_index_row(&mut buf, &row);
        let n = buf.len();
        buf[n - 4..].copy_from_slice(&0u32.to_le_bytes());
        assert!(read_index_rows(&buf).is_err());
    }

    #[test]
    fn frag_table_roundtrip() {
        let recs = vec![
            FragRecord {
                sha1: [7; 20],
                size: 4096,
            },
            FragRecord {
                sha1: [9; 20],
                size: 100,
            },
        ];
        let mut buf = Vec::new();
        write_frag_table(&mut buf, 5000, &recs);
        let (bsize, got) = read_frag_table(&buf).unwrap();
        assert_eq!(bsize, 5000);
        assert_eq!(got, recs);
    }
}
