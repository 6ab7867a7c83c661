//! The `test` transaction: full archive verification.
//!
//! First the index itself is checked: version dates must strictly
//! increase, every fragment pointer must land in the table, and every
//! block offset must lie inside the archive. Then every block is decompressed
//! by the worker pool and verified: journal naming against the fragment
//! table, declared sizes, the redundant size trailer, every fragment
//! hash, and every segment hash. Nothing is written. Unreferenced
//! fragments are reported but are not an error.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::format::{self, BlockKind, SegmentName};
use crate::index::ArchiveIndex;
use crate::scan;
use crate::zpaql::BlockReader;

use super::extract::{plan_blocks, BlockState, ExBlock, JobState};
use super::{check_options, Options};

/// Runs `test`. Returns the process exit code.
pub fn test(opts: &Options) -> Result<i32> {
    check_options(opts)?;
    let archive = opts.archive_path();
    println!("Testing {}", archive.display());
    let outcome = scan::read_archive(&archive, opts.until)?;
    let archive_end = std::fs::metadata(&archive)?.len();
    println!("{archive_end} bytes read from archive");
    let mut bad = outcome.errors > 0;
    if outcome.errors > 0 {
        println!("{} errors found in index", outcome.errors);
    }
    let mut index = outcome.index;
    index.select(&opts.files, &opts.not, false);

    bad |= version_report(&index);
    bad |= fragment_report(&index, archive_end);
    file_report(&index, archive_end)?;

    // Decompress and verify every block.
    let blocks = plan_blocks(&index, true);
    println!(
        "\nTesting {} blocks in {} threads",
        blocks.len(),
        opts.threads
    );
    let state = Mutex::new(JobState {
        block_state: vec![BlockState::Ready; blocks.len()],
        extracted: vec![false; index.fragments.len()],
    });
    let memory = Mutex::new(0u64);
    std::thread::scope(|scope| {
        for _ in 0..opts.threads {
            scope.spawn(|| {
                if let Err(e) = test_worker(&archive, &index, &blocks, &state, &memory, opts) {
                    log::warn!("test worker stopped: {e}");
                }
            });
        }
    });
    let max_memory = memory.into_inner().expect("workers joined");

    let state = state.into_inner().expect("workers joined");
    let bad_blocks = state
        .block_state
        .iter()
        .filter(|&&s| s != BlockState::Good)
        .count();
    println!(
        "{:.3} MB memory per thread needed to decompress",
        max_memory as f64 * 1e-6
    );
    println!("\n{bad_blocks} data blocks bad");
    bad |= bad_blocks > 0;

    // Damaged files, across every stored version.
    let mut damaged = 0u32;
    let mut tested = 0u32;
    for (name, entry) in index.files.iter() {
        for (vi, v) in entry.versions.iter().enumerate() {
            tested += 1;
            let whole = v.frags.iter().all(|&p| {
                (p as usize) < state.extracted.len() && p > 0 && state.extracted[p as usize]
            });
            if !whole {
                if damaged == 0 {
                    println!("\nDamaged files:");
                }
                damaged += 1;
                print!("{} {name}", v.version);
                if vi + 1 < entry.versions.len() {
                    print!(" ({}'th of {} versions)", vi + 1, entry.versions.len());
                }
                println!();
            }
        }
    }
    bad |= damaged > 0;
    println!("{damaged} of {tested} files damaged\n");

    if bad {
        println!("archive corrupted");
        return Ok(1);
    }
    Ok(0)
}

fn version_report(index: &ArchiveIndex) -> bool {
    println!("\n{} versions", index.versions.len() - 1);
    let mut updates = 0u64;
    let mut deletes = 0u64;
    let mut undated = 0u32;
    let mut out_of_order = 0u32;
    let mut earliest = 0i64;
    let mut latest = 0i64;
    for v in index.versions.iter().skip(1) {
        updates += u64::from(v.updates);
        deletes += u64::from(v.deletes);
        if v.date == 0 {
            undated += 1;
            continue;
        }
        if earliest == 0 {
            earliest = v.date;
        }
        if v.date <= latest {
            out_of_order += 1;
        }
        latest = v.date;
    }
    println!("{updates} file additions or updates");
    println!("{deletes} file deletions");
    println!("{} is the first version", crate::date::to_string(earliest));
    println!("{} is the latest version", crate::date::to_string(latest));
    println!("{undated} undated versions");
    println!("{out_of_order} version dates are out of sequence");
    out_of_order > 0
}

fn fragment_report(index: &ArchiveIndex, archive_end: u64) -> bool {
    println!("\n{} fragments", index.fragment_count());
    let mut total = 0i64;
    let mut unknown = 0u32;
    let mut blocks = 0u32;
    let mut nohash = 0u32;
    let mut missing = 0u32;
    let mut largest = 0i64;
    let mut block_bytes = 0i64;
    let mut largest_block = 0i64;
    for (i, f) in index.fragments.iter().enumerate().skip(1) {
        if f.csize >= 0 {
            blocks += 1;
            block_bytes = 0;
        }
        if f.size < 0 {
            unknown += 1;
        } else {
            total += f.size;
            largest = largest.max(f.size);
            block_bytes += f.size;
            largest_block = largest_block.max(block_bytes);
        }
        if f.csize > archive_end as i64 || f.csize < -(i as i64) {
            missing += 1;
        }
        if !f.has_hash() {
            nohash += 1;
        }
    }
    println!("{blocks} blocks");
    println!("{total} known uncompressed bytes");
    let known = index.fragment_count() as i64 - i64::from(unknown);
    if known > 0 {
        println!("{:.3} is average fragment size", total as f64 / known as f64);
    }
    println!("{largest} is the largest fragment size");
    println!("{largest_block} is the largest uncompressed block size");
    println!("{unknown} fragments of unknown size");
    println!("{nohash} fragments without hashes");
    println!("{missing} missing fragments");
    false
}

fn file_report(index: &ArchiveIndex, archive_end: u64) -> Result<()> {
    println!("\n{} files", index.files.len());
    let mut versions = 0u64;
    let mut live = 0u32;
    let mut deleted = 0u32;
    let mut selected = 0u32;
    let mut refs = 0u64;
    let mut all_bytes = 0i64;
    let mut current_bytes = 0i64;
    let mut referenced = vec![false; index.fragments.len()];
    let mut largest: Option<(&String, i64)> = None;
    for (name, entry) in index.files.iter() {
        for (vi, v) in entry.versions.iter().enumerate() {
            versions += 1;
            refs += v.frags.len() as u64;
            let is_last = vi + 1 == entry.versions.len();
            if is_last {
                if v.date == 0 {
                    deleted += 1;
                } else {
                    live += 1;
                    if largest.map_or(true, |(_, s)| v.size > s) {
                        largest = Some((name, v.size));
                    }
                }
                if entry.selected() {
                    selected += 1;
                }
            }
            for &p in &v.frags {
                let p = p as usize;
                if p < 1
                    || p >= index.fragments.len()
                    || index.fragments[p].csize > archive_end as i64
                    || index.fragments[p].csize < -(p as i64)
                {
                    log::warn!("{name} version {} fragment out of range: {p}", v.version);
                    return Err(Error::format("index corrupted"));
                }
                referenced[p] = true;
                if index.fragments[p].size >= 0 {
                    all_bytes += index.fragments[p].size;
                    if is_last {
                        current_bytes += index.fragments[p].size;
                    }
                }
            }
        }
    }
    println!("{versions} file versions");
    println!("{live} files in current version");
    println!("{selected} files selected by command line arguments");
    println!("{deleted} deleted files in current version");
    println!("{refs} references to fragments");
    println!("{all_bytes} known uncompressed bytes in all versions");
    println!("{current_bytes} in current version");
    if current_bytes > 0 {
        println!(
            "{:.3}% compression ratio",
            archive_end as f64 * 100.0 / current_bytes as f64
        );
    }
    if let Some((name, size)) = largest {
        println!("{size} is size of the largest file, {name}");
    }
    let unreferenced = referenced.iter().skip(1).filter(|&&r| !r).count();
    println!("{unreferenced} unreferenced fragments");
    Ok(())
}

fn test_worker(
    archive: &Path,
    index: &ArchiveIndex,
    blocks: &[ExBlock],
    state: &Mutex<JobState>,
    memory: &Mutex<u64>,
    opts: &Options,
) -> Result<()> {
    let file = File::open(archive)?;
    let mut reader = BufReader::new(file);
    for (bi, block) in blocks.iter().enumerate() {
        {
            let mut st = state.lock().expect("job mutex");
            if st.block_state[bi] != BlockState::Ready {
                continue;
            }
            st.block_state[bi] = BlockState::Working;
        }
        match test_block(&mut reader, index, block, opts) {
            Ok(mem) => {
                let mut st = state.lock().expect("job mutex");
                st.block_state[bi] = BlockState::Good;
                for j in block.start..block.start + block.size {
                    st.extracted[j as usize] = true;
                }
                let mut m = memory.lock().expect("memory mutex");
                *m = (*m).max(mem);
            }
            Err(e) => {
                log::warn!(
                    "block {}..{} at offset {}: {e}",
                    block.start,
                    block.start + block.size - 1,
                    block.offset
                );
                let mut st = state.lock().expect("job mutex");
                st.block_state[bi] = BlockState::Bad;
            }
        }
    }
    Ok(())
}

/// Verifies one block completely. Returns the model memory estimate.
fn test_block(
    reader: &mut BufReader<File>,
    index: &ArchiveIndex,
    block: &ExBlock,
    opts: &Options,
) -> Result<u64> {
    reader.seek(SeekFrom::Start(block.offset))?;
    let mut r = BlockReader::new(&mut *reader, block.offset);
    if !r.find_block()? {
        return Err(Error::bad_block(block.offset, "block not found"));
    }
    let memory = r.model().memory_estimate();
    let mut seg = 0u32;
    while let Some(filename) = r.find_filename()? {
        let comment = r.read_comment()?;
        if format::has_journal_tag(&comment) {
            // A journal data block: its name and declared size must agree
            // with the fragment table.
            let seg_name = SegmentName::parse(&filename)
                .ok_or_else(|| Error::bad_block(block.offset, "bad journal segment name"))?;
            if seg_name.kind != BlockKind::Data || seg_name.id != block.start {
                return Err(Error::bad_block(block.offset, "wrong name for data block"));
            }
            let mut expected: i64 = 8;
            for j in block.start..block.start + block.size {
                expected += index.fragments[j as usize].size.max(0) + 4;
            }
            let declared = format::parse_streaming_comment(&comment).size;
            if declared != expected && declared != expected - 4 * i64::from(block.size) {
                return Err(Error::SizeMismatch {
                    what: filename.clone(),
                    expected: expected as u64,
                    actual: declared as u64,
                });
            }

            r.set_output_limit(declared as usize + 1);
            let mut out = Vec::new();
            r.decompress(None, &mut out)?;
            let stored = r.read_segment_end()?;
            if out.len() as i64 != declared {
                return Err(Error::SizeMismatch {
                    what: filename.clone(),
                    expected: declared as u64,
                    actual: out.len() as u64,
                });
            }
            if let Some(stored) = stored {
                if stored != r.output_sha1() {
                    return Err(Error::ChecksumMismatch { what: filename });
                }
            }
            verify_data_payload(index, block, &out, opts)?;
        } else {
            // Streaming segment: just decode and check its hash.
            r.set_output_limit(1 << 30);
            let mut out = Vec::new();
            r.decompress(None, &mut out)?;
            let stored = r.read_segment_end()?;
            if let Some(stored) = stored {
                if stored != r.output_sha1() {
                    return Err(Error::ChecksumMismatch {
                        what: format!("segment {seg} at {}", block.offset),
                    });
                }
            }
        }
        seg += 1;
    }
    Ok(memory)
}

/// Checks fragment hashes and the redundant trailer of a decoded data
/// block.
fn verify_data_payload(
    index: &ArchiveIndex,
    block: &ExBlock,
    out: &[u8],
    opts: &Options,
) -> Result<()> {
    let mut pos = 0usize;
    for j in block.start..block.start + block.size {
        let f = &index.fragments[j as usize];
        let sz = f.size.max(0) as usize;
        if pos + sz > out.len() {
            return Err(Error::format("fragment sizes overflow block"));
        }
        if !opts.fragile && f.has_hash() {
            let digest: [u8; 20] = Sha1::digest(&out[pos..pos + sz]).into();
            if digest != f.sha1 {
                return Err(Error::ChecksumMismatch {
                    what: format!("fragment {j}"),
                });
            }
        }
        pos += sz;
    }

    // Trailer: per-fragment sizes (robust only), first id, count. Zeros
    // are accepted where fragile mode omits the information.
    let tail = &out[out.len() - 8..];
    let first = u32::from_le_bytes(tail[0..4].try_into().expect("4 bytes"));
    let count = u32::from_le_bytes(tail[4..8].try_into().expect("4 bytes"));
    if first != 0 && first != block.start {
        return Err(Error::format("bad fragment start in trailer"));
    }
    if count != 0 && count != block.size {
        return Err(Error::format("bad fragment count in trailer"));
    }
    if count != 0 {
        let sizes = &out[pos..];
        for (i, j) in (block.start..block.start + block.size).enumerate() {
            let stored = u32::from_le_bytes(
                sizes[i * 4..i * 4 + 4].try_into().expect("4 bytes"),
            );
            if i64::from(stored) != index.fragments[j as usize].size {
                return Err(Error::format("bad fragment size in trailer"));
            }
        }
    }
    Ok(())
}
