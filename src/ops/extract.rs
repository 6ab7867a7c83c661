//! The `extract` transaction.
//!
//! After the scan, selected files' fragment lists are grouped by data
//! block. Worker threads claim blocks (READY → WORKING under the job
//! mutex), decompress them into memory, verify every fragment hash, and
//! then scatter runs of consecutive fragments into the output files
//! under a write mutex. Blocks of the streaming format (unknown or
//! oversized fragment lengths) cannot be decoded out of order; the main
//! thread replays them sequentially while the workers run.
//!
//! Nothing is clobbered without `--force`; a file is closed and its
//! date and permissions restored once its last fragment is written.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::format;
use crate::index::{ArchiveIndex, EXTRACTED};
use crate::path::RenameMap;
use crate::scan;
use crate::zpaql::BlockReader;

use super::{check_options, make_parent_dirs, restore_metadata, Options};

/// Largest fragment a random-access block may hold; anything bigger (or
/// unsized) forces sequential streaming.
const STREAM_LIMIT: i64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BlockState {
    Ready,
    Working,
    Good,
    Bad,
}

/// One data block with the files that point into it.
pub(super) struct ExBlock {
    /// First fragment id in the block.
    pub start: u32,
    /// Number of fragments to decompress (prefix of the block).
    pub size: u32,
    /// Archive offset.
    pub offset: u64,
    /// Selected files referencing the block, in path order.
    pub files: Vec<String>,
    /// Requires sequential replay.
    pub streaming: bool,
}

pub(super) struct JobState {
    pub block_state: Vec<BlockState>,
    /// Fragment verification marks (the EXTRACTED state).
    pub extracted: Vec<bool>,
}

struct WriteState {
    /// Fragments written so far per selected file.
    written: HashMap<String, u32>,
    /// Cache of the most recently open output file.
    last_open: Option<(String, File)>,
}

/// Groups the fragments of every selected file into block work items.
/// Shared by `extract` and `test`.
pub(super) fn plan_blocks(index: &ArchiveIndex, select_all_frags: bool) -> Vec<ExBlock> {
    let mut blocks: Vec<ExBlock> = Vec::new();
    let mut frag_block = vec![0usize; index.fragments.len()];
    for i in 1..index.fragments.len() {
        let f = &index.fragments[i];
        if f.csize >= 0 && f.csize != EXTRACTED {
            blocks.push(ExBlock {
                start: i as u32,
                size: 0,
                offset: f.csize as u64,
                files: Vec::new(),
                streaming: false,
            });
        }
        let last_idx = blocks.len().checked_sub(1);
        if let (Some(last_idx), Some(b)) = (last_idx, blocks.last_mut()) {
            frag_block[i] = last_idx;
            if f.size < 0 || f.size > STREAM_LIMIT {
                b.streaming = true;
            }
            if select_all_frags {
                b.size = b.size.max((i as u32) - b.start + 1);
            }
        }
    }

    if !select_all_frags {
        for (name, entry) in index.files.iter() {
            if !entry.selected() || !entry.is_live() {
                continue;
            }
            let latest = entry.latest().expect("live entry has versions");
            for &p in &latest.frags {
                let p = p as usize;
                if p == 0 || p >= index.fragments.len() {
                    log::warn!("{name}: bad fragment ids, skipping");
                    continue;
                }
                let in_block = (-index.fragments[p].csize).max(0) as u32;
                let Some(b) = blocks.get_mut(frag_block[p]) else {
                    continue;
                };
                b.size = b.size.max(in_block + 1);
                if b.files.last() != Some(name) {
                    b.files.push(name.clone());
                }
                if latest.size < 0 {
                    b.streaming = true;
                }
            }
        }
    }
    blocks
}

/// Runs `extract`. Returns the process exit code.
pub fn extract(opts: &Options) -> Result<i32> {
    check_options(opts)?;
    let archive = opts.archive_path();
    let outcome = scan::read_archive(&archive, opts.until)?;
    let mut index = outcome.index;
    index.select(&opts.files, &opts.not, false);
    let map = opts.rename_map();

    // Refuse to overwrite existing outputs unless forced.
    if !opts.force {
        for (name, entry) in index.files.iter() {
            if entry.selected() && entry.is_live() {
                let external = map.rename(name);
                if !external.ends_with('/') && Path::new(&external).exists() {
                    return Err(Error::Config(format!(
                        "file exists: {external} (use --force to overwrite)"
                    )));
                }
            }
        }
    }

    let blocks = plan_blocks(&index, false);
    let state = Mutex::new(JobState {
        block_state: vec![BlockState::Ready; blocks.len()],
        extracted: vec![false; index.fragments.len()],
    });
    let write = Mutex::new(WriteState {
        written: index
            .files
            .iter()
            .filter(|(_, e)| e.selected() && e.is_live())
            .map(|(n, _)| (n.clone(), 0))
            .collect(),
        last_open: None,
    });

    if opts.verbose() {
        println!("Starting {} decompression jobs", opts.threads);
    }
    std::thread::scope(|scope| {
        for _ in 0..opts.threads {
            scope.spawn(|| {
                if let Err(e) = worker(&archive, &index, &blocks, &state, &write, opts, &map) {
                    log::warn!("decompression worker stopped: {e}");
                }
            });
        }
        // Streaming blocks are replayed here while the workers run.
        if let Err(e) = streaming_pass(&archive, &index, &blocks, &state, &write, opts, &map) {
            log::warn!("streaming extraction stopped: {e}");
        }
    });

    // Directories, deepest first, with their stored metadata.
    for (name, entry) in index.files.iter().rev() {
        if entry.selected() && name.ends_with('/') {
            if let Some(v) = entry.latest() {
                if v.date != 0 {
                    let external = map.rename(name);
                    let dir = external.trim_end_matches('/');
                    if let Err(e) = std::fs::create_dir_all(dir) {
                        log::warn!("creating {dir}: {e}");
                    }
                    restore_metadata(dir, v.date, v.attr);
                }
            }
        }
    }

    // Per-file completeness report.
    let state = state.into_inner().expect("workers joined");
    let write = write.into_inner().expect("workers joined");
    let mut extracted_files = 0u32;
    let mut failed = 0u32;
    for (name, entry) in index.files.iter() {
        if !entry.selected() || !entry.is_live() {
            continue;
        }
        let latest = entry.latest().expect("live");
        extracted_files += 1;
        let ok_frags = latest
            .frags
            .iter()
            .filter(|&&p| (p as usize) < state.extracted.len() && state.extracted[p as usize])
            .count();
        let written = write.written.get(name).copied().unwrap_or(0);
        if ok_frags != latest.frags.len() || written as usize != latest.frags.len() {
            if failed == 0 {
                eprintln!("\nFailed (extracted,written/total fragments, version, file):");
            }
            failed += 1;
            eprintln!(
                "{ok_frags},{written}/{} {} {}",
                latest.frags.len(),
                latest.version,
                map.rename(name)
            );
        }
    }
    if opts.verbose() || failed > 0 {
        eprintln!("Extracted {} of {extracted_files} files OK ({failed} errors)", extracted_files - failed);
    }
    Ok(i32::from(failed > 0))
}

#[allow(clippy::too_many_arguments)]
fn worker(
    archive: &Path,
    index: &ArchiveIndex,
    blocks: &[ExBlock],
    state: &Mutex<JobState>,
    write: &Mutex<WriteState>,
    opts: &Options,
    map: &RenameMap,
) -> Result<()> {
    let file = File::open(archive)?;
    let mut reader = BufReader::new(file);
    for (bi, block) in blocks.iter().enumerate() {
        {
            let mut st = state.lock().expect("job mutex");
            if st.block_state[bi] != BlockState::Ready || block.size == 0 || block.streaming {
                continue;
            }
            st.block_state[bi] = BlockState::Working;
        }
        match extract_block(&mut reader, index, block, opts) {
            Ok(out) => {
                {
                    let mut st = state.lock().expect("job mutex");
                    st.block_state[bi] = BlockState::Good;
                    for j in block.start..block.start + block.size {
                        st.extracted[j as usize] = true;
                    }
                }
                let mut ws = write.lock().expect("write mutex");
                scatter_block(index, block, &out, &mut ws, opts, map);
            }
            Err(e) => {
                log::warn!(
                    "skipping fragments {}-{} at offset {}: {e}",
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

/// Decompresses one random-access block into memory and verifies its
/// fragment hashes.
fn extract_block(
    reader: &mut BufReader<File>,
    index: &ArchiveIndex,
    block: &ExBlock,
    opts: &Options,
) -> Result<Vec<u8>> {
    // Bytes needed to cover the selected fragments, and the full block
    // size as the allocation cap.
    let mut output_size = 0usize;
    for j in block.start..block.start + block.size {
        output_size += index.fragments[j as usize].size.max(0) as usize;
    }
    let mut max_size = output_size + block.size as usize * 4 + 8;
    let mut j = block.start + block.size;
    while (j as usize) < index.fragments.len() && index.fragments[j as usize].csize < 0 {
        max_size += index.fragments[j as usize].size.max(0) as usize + 4;
        j += 1;
    }

    reader.seek(SeekFrom::Start(block.offset))?;
    let mut r = BlockReader::new(reader, block.offset);
    if !r.find_block()? {
        return Err(Error::bad_block(block.offset, "block not found"));
    }
    r.set_output_limit(max_size);
    let mut out = Vec::with_capacity(output_size.min(max_size));
    while let Some(_name) = r.find_filename()? {
        let comment = r.read_comment()?;
        if format::has_journal_tag(&comment) {
            while out.len() < output_size && r.decompress(Some(1 << 14), &mut out)? {}
            break;
        }
        r.decompress(None, &mut out)?;
        r.read_segment_end()?;
        if out.len() >= output_size {
            break;
        }
    }
    if out.len() < output_size {
        return Err(Error::SizeMismatch {
            what: format!("block at {}", block.offset),
            expected: output_size as u64,
            actual: out.len() as u64,
        });
    }

    if !opts.fragile {
        let mut pos = 0usize;
        for j in block.start..block.start + block.size {
            let f = &index.fragments[j as usize];
            let sz = f.size.max(0) as usize;
            if f.has_hash() {
                let digest: [u8; 20] = Sha1::digest(&out[pos..pos + sz]).into();
                if digest != f.sha1 {
                    return Err(Error::ChecksumMismatch {
                        what: format!("fragment {j}"),
                    });
                }
            }
            pos += sz;
        }
    }
    Ok(out)
}

/// Writes every selected file's fragments that live in this block.
fn scatter_block(
    index: &ArchiveIndex,
    block: &ExBlock,
    out: &[u8],
    ws: &mut WriteState,
    opts: &Options,
    map: &RenameMap,
) {
    for name in &block.files {
        let entry = &index.files[name];
        let Some(latest) = entry.latest() else { continue };
        let total = latest.frags.len() as u32;
        let Some(&written) = ws.written.get(name) else { continue };
        if written >= total {
            continue;
        }

        let mut offset = 0i64;
        let mut j = 0usize;
        let mut wrote_any = false;
        while j < latest.frags.len() {
            let p = latest.frags[j] as usize;
            if (p as u32) < block.start || (p as u32) >= block.start + block.size {
                offset += index.fragments[p].size.max(0);
                j += 1;
                continue;
            }

            // Locate the fragment inside the decompressed block.
            let mut pos = 0usize;
            for k in block.start as usize..p {
                pos += index.fragments[k].size.max(0) as usize;
            }

            // Extend over consecutive in-block fragments.
            let mut run = index.fragments[p].size.max(0) as usize;
            let mut consumed = 1u32;
            while j + 1 < latest.frags.len()
                && latest.frags[j + 1] == latest.frags[j] + 1
                && latest.frags[j + 1] < block.start + block.size
                && latest.frags[j + 1] as u32 >= block.start
            {
                j += 1;
                run += index.fragments[latest.frags[j] as usize].size.max(0) as usize;
                consumed += 1;
            }

            let external = map.rename(name);
            let fresh = written == 0 && !wrote_any;
            let io = open_output(ws, &external, name, fresh).and_then(|f| {
                f.seek(SeekFrom::Start(offset as u64))?;
                f.write_all(&out[pos..pos + run])
            });
            match io {
                Ok(()) => {
                    wrote_any = true;
                    let w = ws.written.get_mut(name).expect("present");
                    *w += consumed;
                    if *w == total {
                        // Complete: close and restore metadata.
                        ws.last_open = None;
                        restore_metadata(&external, latest.date, latest.attr);
                    }
                }
                Err(e) => {
                    log::warn!("writing {external}: {e}");
                    break;
                }
            }
            offset += run as i64;
            j += 1;
        }
    }
}

/// Opens (or reuses) the output file, creating directories and
/// truncating on first write.
fn open_output<'a>(
    ws: &'a mut WriteState,
    external: &str,
    name: &str,
    fresh: bool,
) -> std::io::Result<&'a mut File> {
    let cached = matches!(&ws.last_open, Some((n, _)) if n == name);
    if !cached {
        make_parent_dirs(external);
        let file = if fresh {
            File::create(external)?
        } else {
            std::fs::OpenOptions::new().write(true).create(true).open(external)?
        };
        ws.last_open = Some((name.to_string(), file));
    }
    Ok(&mut ws.last_open.as_mut().expect("set above").1)
}

/// Sequentially replays streaming-format blocks, writing segment by
/// segment.
#[allow(clippy::too_many_arguments)]
fn streaming_pass(
    archive: &Path,
    index: &ArchiveIndex,
    blocks: &[ExBlock],
    state: &Mutex<JobState>,
    write: &Mutex<WriteState>,
    opts: &Options,
    map: &RenameMap,
) -> Result<()> {
    if !blocks.iter().any(|b| b.streaming && b.size > 0) {
        return Ok(());
    }
    let file = File::open(archive)?;
    let mut reader = BufReader::new(file);
    let mut last_file = {
        let s = archive.to_string_lossy();
        s.strip_suffix(".zpaq").unwrap_or(&s).to_string()
    };
    let mut out: Option<(String, File, String)> = None; // internal, file, external

    for (bi, block) in blocks.iter().enumerate() {
        if !block.streaming || block.size == 0 {
            continue;
        }
        {
            let mut st = state.lock().expect("job mutex");
            if st.block_state[bi] != BlockState::Ready {
                continue;
            }
            st.block_state[bi] = BlockState::Working;
        }
        if opts.verbose() {
            println!(
                "main: [{}..{}] block {}",
                block.start,
                block.start + block.size - 1,
                bi + 1
            );
        }
        let run = (|| -> Result<()> {
            reader.seek(SeekFrom::Start(block.offset))?;
            let mut r = BlockReader::new(&mut reader, block.offset);
            if !r.find_block()? {
                return Err(Error::bad_block(block.offset, "block not found"));
            }
            let mut seg = 0u32;
            while let Some(filename) = r.find_filename()? {
                r.read_comment()?;
                if seg >= block.size {
                    break;
                }
                if !filename.is_empty() {
                    last_file = filename;
                    out = None;
                }
                if out.is_none() {
                    if let Some(entry) = index.files.get(&last_file) {
                        let selected = {
                            let ws = write.lock().expect("write mutex");
                            ws.written.contains_key(&last_file)
                        };
                        if selected && entry.is_live() {
                            let external = map.rename(&last_file);
                            make_parent_dirs(&external);
                            match File::create(&external) {
                                Ok(f) => {
                                    if opts.verbose() {
                                        println!("main: extracting {external}");
                                    }
                                    out = Some((last_file.clone(), f, external));
                                }
                                Err(e) => log::warn!("creating {external}: {e}"),
                            }
                        }
                    }
                }
                let mut data = Vec::new();
                r.set_output_limit(1 << 30);
                r.decompress(None, &mut data)?;
                let stored = r.read_segment_end()?;
                if let Some(stored) = stored {
                    if stored != r.output_sha1() {
                        return Err(Error::ChecksumMismatch {
                            what: format!("streaming segment of {last_file}"),
                        });
                    }
                }
                if let Some((internal, f, external)) = out.as_mut() {
                    f.write_all(&data)?;
                    let mut ws = write.lock().expect("write mutex");
                    if let Some(w) = ws.written.get_mut(internal) {
                        *w += 1;
                        if let Some(v) = index.files[internal].latest() {
                            if *w as usize == v.frags.len() {
                                restore_metadata(external, v.date, v.attr);
                            }
                        }
                    }
                }
                {
                    let mut st = state.lock().expect("job mutex");
                    st.extracted[(block.start + seg) as usize] = true;
                }
                seg += 1;
            }
            Ok(())
        })();
        let mut st = state.lock().expect("job mutex");
        st.block_state[bi] = match run {
            Ok(()) => BlockState::Good,
            Err(e) => {
                log::warn!(
                    "main: skipping fragments {}-{}: {e}",
                    block.start,
                    block.start + block.size - 1
                );
                BlockState::Bad
            }
        };
    }
    Ok(())
}
