//! Archive scanning: rebuilding the index from the journal.
//!
//! One sequential pass reads every block header. Transaction headers
//! carry a jump over their data blocks, so a normal scan touches only
//! header, fragment-table, and index blocks. Blocks that fail to parse
//! are counted and skipped (the reader resynchronizes on the locator
//! tag); fragment tables that arrive out of order or duplicated flag the
//! archive for a second, recovery pass that re-reads the data blocks and
//! rebuilds the lost tables from their redundant trailers.
//!
//! Segments that do not follow the journal naming are the streaming
//! format: each segment is one fragment whose metadata lives in the
//! filename and comment.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::date;
use crate::error::{Error, Result};
use crate::format::{self, BlockKind, SegmentName};
use crate::index::{ArchiveIndex, FileVersion, Fragment, Version, HT_BAD};
use crate::zpaql::BlockReader;

/// Everything a scan learns.
pub struct ScanOutcome {
    /// The reconstructed in-memory model.
    pub index: ArchiveIndex,
    /// Archive offset where the next transaction would append (the
    /// truncation point when rolling back).
    pub end_offset: u64,
    /// Blocks that failed to parse or verify.
    pub errors: u32,
    /// True if the recovery pass ran.
    pub recovered: bool,
    /// True if at least one block was found.
    pub found_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Normal,
    Flagged,
    Recover,
}

/// Reads the archive at `path` up to the `until` limit (a version count
/// if ≤ 9999999, else a date). A missing file yields an empty index.
pub fn read_archive(path: &Path, until: i64) -> Result<ScanOutcome> {
    let mut out = ScanOutcome {
        index: ArchiveIndex::new(),
        end_offset: 0,
        errors: 0,
        recovered: false,
        found_data: false,
    };
    if !path.exists() {
        return Ok(out);
    }
    log::debug!("reading archive {}", path.display());

    let default_name = {
        let s = path.to_string_lossy();
        s.strip_suffix(".zpaq").unwrap_or(&s).to_string()
    };
    let mut pass = Pass::Normal;
    loop {
        let file = File::open(path)?;
        let mut reader = BlockReader::new(BufReader::new(file), 0);
        let stopped = scan_pass(&mut reader, until, &default_name, &mut out, &mut pass)?;
        if stopped || pass != Pass::Flagged {
            break;
        }
        // Unordered or duplicate fragment tables: re-read the data
        // blocks and rebuild the missing rows from their trailers.
        log::warn!("attempting to recover fragment tables");
        pass = Pass::Recover;
        out.recovered = true;
    }

    if pass == Pass::Recover {
        // Sizes summed from placeholder rows are stale after recovery.
        for entry in out.index.files.values_mut() {
            for v in entry.versions.iter_mut() {
                v.size = 0;
                for &p in &v.frags {
                    if let Some(f) = out.index.fragments.get(p as usize) {
                        v.size += f.size;
                    }
                }
            }
        }
    }
    if !out.found_data && std::fs::metadata(path)?.len() > 0 {
        return Err(Error::format("archive contains no data"));
    }
    Ok(out)
}

/// One full pass. Returns true if the scan stopped at the rollback
/// point (no recovery pass should follow).
fn scan_pass(
    reader: &mut BlockReader<BufReader<File>>,
    until: i64,
    default_name: &str,
    out: &mut ScanOutcome,
    pass: &mut Pass,
) -> Result<bool> {
    let index = &mut out.index;
    if *pass == Pass::Recover {
        // The first pass already built the file map and version log.
    } else {
        *index = ArchiveIndex::new();
    }
    let mut data_offset: u64 = 0;
    let mut last_file = default_name.to_string();
    let mut first_segment = true;

    loop {
        match reader.find_block() {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!("skipping block at {}: {e}", reader.tell());
                out.errors += 1;
                continue;
            }
        }
        out.found_data = true;
        let block_offset = reader.block_offset();

        let result = scan_block(
            reader,
            until,
            index,
            pass,
            &mut data_offset,
            &mut last_file,
            &mut first_segment,
            block_offset,
            &mut out.errors,
        );
        match result {
            Ok(BlockScan::Continue) => {
                out.end_offset = reader.tell();
            }
            Ok(BlockScan::Stop) => {
                out.end_offset = block_offset;
                return Ok(true);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!("skipping block at {block_offset}: {e}");
                out.errors += 1;
            }
        }
    }
}

enum BlockScan {
    Continue,
    Stop,
}

#[allow(clippy::too_many_arguments)]
fn scan_block(
    reader: &mut BlockReader<BufReader<File>>,
    until: i64,
    index: &mut ArchiveIndex,
    pass: &mut Pass,
    data_offset: &mut u64,
    last_file: &mut String,
    first_segment: &mut bool,
    block_offset: u64,
    errors: &mut u32,
) -> Result<BlockScan> {
    let mut segs: i64 = 0;
    while let Some(filename) = reader.find_filename()? {
        let comment = reader.read_comment()?;
        let name = SegmentName::parse(&filename);
        let journaling = name.is_some() && format::has_journal_tag(&comment);

        if journaling {
            let seg = name.expect("checked above");
            let declared = format::parse_streaming_comment(&comment).size;
            if declared < 0 {
                return Err(Error::bad_block(block_offset, "journal comment without size"));
            }

            // Recovery revisits only data blocks whose table is missing.
            let decode = *pass != Pass::Recover
                || (seg.kind == BlockKind::Data
                    && seg.id > 0
                    && (seg.id as usize) < index.fragments.len()
                    && index.fragments[seg.id as usize].csize == HT_BAD);
            let mut payload = Vec::new();
            if decode {
                reader.set_output_limit(declared as usize);
                reader.decompress(None, &mut payload)?;
                let stored = reader.read_segment_end()?;
                if payload.len() as i64 != declared {
                    return Err(Error::SizeMismatch {
                        what: filename.clone(),
                        expected: declared as u64,
                        actual: payload.len() as u64,
                    });
                }
                if let Some(stored) = stored {
                    if stored != reader.output_sha1() {
                        return Err(Error::ChecksumMismatch {
                            what: filename.clone(),
                        });
                    }
                }
            } else {
                reader.read_segment_end()?;
            }

            match seg.kind {
                BlockKind::Header if *pass != Pass::Recover => {
                    *data_offset = reader.tell() + 1;
                    let mut stop = if until < date::MIN_DATE {
                        index.versions.len() as i64 > until
                    } else {
                        until < seg.date
                    };
                    if payload.len() == 8 {
                        let jump =
                            i64::from_le_bytes(payload[..8].try_into().expect("8 bytes"));
                        if jump < 0 {
                            log::warn!("incomplete transaction ignored");
                            stop = true;
                        } else if jump > 0 && !stop {
                            reader.skip(jump as u64)?;
                        }
                    } else {
                        log::warn!("bad transaction header size {}", payload.len());
                        *errors += 1;
                        stop = true;
                    }
                    if stop {
                        return Ok(BlockScan::Stop);
                    }
                    index.versions.push(Version {
                        date: seg.date,
                        offset: block_offset as i64,
                        first_fragment: index.fragments.len() as u32,
                        ..Version::default()
                    });
                }

                BlockKind::FragTable if *pass != Pass::Recover && seg.id > 0 => {
                    let (bsize, records) = format::read_frag_table(&payload)?;
                    let num = seg.id as usize;
                    if index.fragments.len() != num {
                        log::warn!(
                            "unordered fragment tables: expected {} found {num}",
                            index.fragments.len()
                        );
                        *pass = Pass::Flagged;
                    }
                    for (i, rec) in records.iter().enumerate() {
                        while index.fragments.len() <= num + i {
                            index.fragments.push(Fragment::unknown());
                        }
                        let f = &mut index.fragments[num + i];
                        if f.has_hash() {
                            log::warn!("duplicate fragment id {}", num + i);
                            *pass = Pass::Flagged;
                            continue;
                        }
                        f.sha1 = rec.sha1;
                        f.size = i64::from(rec.size);
                        if f.csize == HT_BAD {
                            f.csize = if i == 0 {
                                *data_offset as i64
                            } else {
                                -(i as i64)
                            };
                        }
                    }
                    *data_offset += u64::from(bsize);
                }

                BlockKind::Data if *pass != Pass::Recover && seg.id > 0 => {
                    // Visited only when the transaction jump was zero:
                    // pre-create the rows so their location is known.
                    let trailer = parse_data_trailer(&payload);
                    if let Some((first, count, _)) = trailer {
                        if first as usize == seg.id as usize {
                            for i in 0..count as usize {
                                while index.fragments.len() <= seg.id as usize + i {
                                    index.fragments.push(Fragment::unknown());
                                }
                                let f = &mut index.fragments[seg.id as usize + i];
                                f.csize = if i == 0 {
                                    block_offset as i64
                                } else {
                                    -(i as i64)
                                };
                            }
                        }
                    }
                }

                BlockKind::Index if *pass != Pass::Recover => {
                    for row in format::read_index_rows(&payload)? {
                        let version = index.versions.len() as u32 - 1;
                        let entry = index.files.entry(row.name).or_default();
                        let mut fv = FileVersion {
                            version,
                            date: row.date,
                            size: 0,
                            attr: row.attr,
                            frags: row.frags,
                        };
                        let ver = index
                            .versions
                            .last_mut()
                            .expect("version log never empty");
                        if fv.date != 0 {
                            ver.updates += 1;
                        } else {
                            ver.deletes += 1;
                        }
                        for &p in &fv.frags {
                            let p = p as usize;
                            if p >= index.fragments.len() + (1 << 24) {
                                return Err(Error::bad_block(block_offset, "bad fragment id"));
                            }
                            while p >= index.fragments.len() {
                                *pass = Pass::Flagged;
                                index.fragments.push(Fragment::unknown());
                            }
                            fv.size += index.fragments[p].size;
                            ver.bytes += index.fragments[p].size;
                        }
                        entry.versions.push(fv);
                    }
                }

                BlockKind::Data if *pass == Pass::Recover => {
                    recover_data_block(index, seg, &payload, block_offset);
                }

                _ => {
                    if *pass != Pass::Recover {
                        log::warn!("bad journal block ignored: {filename}");
                        *errors += 1;
                    }
                }
            }
        } else if *pass != Pass::Recover {
            // Streaming format: one fragment per segment, metadata in the
            // filename and comment.
            if !filename.is_empty() {
                *last_file = filename.clone();
            }
            let info = format::parse_streaming_comment(&comment);

            // The first segment of a block opens a new undated version
            // unless one is already accumulating.
            if segs == 0
                && (index.versions.len() == 1
                    || index.versions.last().expect("nonempty").date != 0)
            {
                if index.versions.len() as i64 > until {
                    return Ok(BlockScan::Stop);
                }
                index.versions.push(Version {
                    offset: block_offset as i64,
                    first_fragment: index.fragments.len() as u32,
                    ..Version::default()
                });
            }

            let stored = reader.read_segment_end()?;
            let entry = index.files.entry(last_file.clone()).or_default();
            if !filename.is_empty() || *first_segment {
                entry.versions.push(FileVersion {
                    version: index.versions.len() as u32 - 1,
                    date: info.date.max(0),
                    size: 0,
                    attr: info.attr,
                    frags: Vec::new(),
                });
                index
                    .versions
                    .last_mut()
                    .expect("version log never empty")
                    .updates += 1;
            }
            let fv = entry
                .versions
                .last_mut()
                .expect("pushed above or carried over");
            fv.frags.push(index.fragments.len() as u32);
            if info.size >= 0 && fv.size >= 0 {
                fv.size += info.size;
            } else {
                fv.size = -1;
            }
            if info.size >= 0 {
                index
                    .versions
                    .last_mut()
                    .expect("version log never empty")
                    .bytes += info.size;
            }
            index.fragments.push(Fragment {
                sha1: stored.unwrap_or([0; 20]),
                size: if info.size > i64::from(i32::MAX) {
                    -1
                } else {
                    info.size
                },
                csize: if segs == 0 {
                    block_offset as i64
                } else {
                    -(segs as i64)
                },
            });
        } else {
            reader.read_segment_end()?;
        }
        segs += 1;
        *first_segment = false;
    }
    Ok(BlockScan::Continue)
}

/// Reads the `(sizes, first, count)` trailer of a data block; None for
/// fragile blocks (zero first and count).
fn parse_data_trailer(payload: &[u8]) -> Option<(u32, u32, &[u8])> {
    if payload.len() < 8 {
        return None;
    }
    let tail = &payload[payload.len() - 8..];
    let first = u32::from_le_bytes(tail[0..4].try_into().expect("4 bytes"));
    let count = u32::from_le_bytes(tail[4..8].try_into().expect("4 bytes"));
    if count == 0 {
        return None;
    }
    let need = count as usize * 4 + 8;
    if need > payload.len() {
        return None;
    }
    Some((first, count, &payload[payload.len() - need..payload.len() - 8]))
}

/// Rebuilds fragment rows from a decoded data block during recovery.
fn recover_data_block(
    index: &mut ArchiveIndex,
    seg: SegmentName,
    payload: &[u8],
    block_offset: u64,
) {
    let num = seg.id as usize;
    if num == 0 || num >= index.fragments.len() + (1 << 24) {
        return;
    }
    if !payload.is_empty() && index.fragments.get(num).map_or(true, |f| f.csize == HT_BAD) {
        if let Some((first, count, sizes)) = parse_data_trailer(payload) {
            let first = if first == 0 { num as u32 } else { first };
            if first as usize == num {
                log::warn!(
                    "recovering fragments {num}-{} at offset {block_offset}",
                    num + count as usize - 1
                );
                while index.fragments.len() <= num + count as usize {
                    index.fragments.push(Fragment::unknown());
                }
                let mut sum = 0usize;
                for i in 0..count as usize {
                    let sz =
                        u32::from_le_bytes(sizes[i * 4..i * 4 + 4].try_into().expect("4 bytes"));
                    index.fragments[num + i].size = i64::from(sz);
                    index.fragments[num + i].csize =
                        if i == 0 { block_offset as i64 } else { -(i as i64) };
                    sum += sz as usize;
                }
                // With intact data, the hashes can be recomputed.
                if sum + count as usize * 4 + 8 == payload.len() {
                    let mut pos = 0usize;
                    for i in 0..count as usize {
                        let sz = index.fragments[num + i].size as usize;
                        index.fragments[num + i].sha1 =
                            Sha1::digest(&payload[pos..pos + sz]).into();
                        pos += sz;
                    }
                }
            }
        }
    }
    // Offsets learned from chained table sizes can drift; the block's
    // real position wins.
    if let Some(f) = index.fragments.get_mut(num) {
        if f.csize != block_offset as i64 && f.csize != HT_BAD {
            log::warn!(
                "changing block {num} offset from {} to {block_offset}",
                f.csize
            );
        }
        f.csize = block_offset as i64;
    }
}

/// Writes a transaction header block (jump unknown = 0, aborted < 0,
/// else the byte distance to the first post-transaction byte).
pub fn write_transaction_header(
    out: &mut Vec<u8>,
    date: i64,
    jump: i64,
    frag_count: usize,
    fragile: bool,
) -> Result<()> {
    let name = SegmentName {
        date,
        kind: BlockKind::Header,
        id: frag_count as u32,
    }
    .format();
    let payload = jump.to_le_bytes().to_vec();
    crate::method::compress_block(out, payload, "0", &name, None, 0, fragile)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_archive_is_empty() {
        let out = read_archive(Path::new("/nonexistent/archive.zpaq"), i64::MAX).unwrap();
        assert_eq!(out.index.fragment_count(), 0);
        assert_eq!(out.end_offset, 0);
        assert!(!out.found_data);
    }

    #[test]
    fn trailer_parse() {
        let mut payload = vec![1, 2, 3, 4];
        payload.extend_from_slice(&4u32.to_le_bytes()); // one size
        payload.extend_from_slice(&7u32.to_le_bytes()); // first id
        payload.extend_from_slice(&1u32.to_le_bytes()); // count
        let (first, count, sizes) = parse_data_trailer(&payload).unwrap();
        assert_eq!((first, count), (7, 1));
        assert_eq!(sizes, 4u32.to_le_bytes());

        // Fragile: zero count.
        let mut fragile = vec![1, 2, 3, 4];
        fragile.extend_from_slice(&0u32.to_le_bytes());
        fragile.extend_from_slice(&0u32.to_le_bytes());
        assert!(parse_data_trailer(&fragile).is_none());
    }

    #[test]
    fn header_block_roundtrip() {
        let mut arc = Vec::new();
        write_transaction_header(&mut arc, 20240229153000, 1234, 5, false).unwrap();
        let mut r = BlockReader::new(arc.as_slice(), 0);
        assert!(r.find_block().unwrap());
        let name = r.find_filename().unwrap().unwrap();
        let seg = SegmentName::parse(&name).unwrap();
        assert_eq!(seg.kind, BlockKind::Header);
        assert_eq!(seg.date, 20240229153000);
        assert_eq!(seg.id, 5);
        let comment = r.read_comment().unwrap();
        assert!(format::has_journal_tag(&comment));
        let mut payload = Vec::new();
        r.decompress(None, &mut payload).unwrap();
        assert_eq!(i64::from_le_bytes(payload[..8].try_into().unwrap()), 1234);
    }
}
