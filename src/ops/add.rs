//! The `add` and `delete` transactions.
//!
//! An update appends one transaction: a header block with a placeholder
//! jump, the new data blocks (built from content-defined fragments that
//! survived dedup), the fragment-table blocks, the index blocks, and
//! finally the back-patched jump in the header. Rolling back first
//! truncates the archive to the requested version's boundary, so a
//! subsequent update rewrites history from there.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::date;
use crate::error::{Error, Result};
use crate::format::{self, BlockKind, FragRecord, IndexRow, SegmentName};
use crate::fragment::{read_fragment, BlockAnalyzer, MAX_FRAGMENT};
use crate::index::{DedupIndex, Fragment};
use crate::method;
use crate::pipeline::{BlockJob, CompressPipeline};
use crate::scan;

use super::{check_options, scan_external, ArchiveSink, Options};

/// Runs `add` (or `delete` when `deleting`). Returns the process exit
/// code.
pub fn add(opts: &Options, deleting: bool) -> Result<i32> {
    check_options(opts)?;
    if opts.files.is_empty() {
        return Err(Error::Config("nothing to add: no paths given".into()));
    }
    let archive = opts.archive_path();
    let blocksize = method::block_size(&opts.method);

    // Rebuild the index; remember where the next transaction starts.
    let outcome = if !opts.dry_run() && archive.exists() {
        scan::read_archive(&archive, opts.until)?
    } else {
        scan::ScanOutcome {
            index: crate::index::ArchiveIndex::new(),
            end_offset: 0,
            errors: 0,
            recovered: false,
            found_data: false,
        }
    };
    let mut index = outcome.index;
    let header_pos = outcome.end_offset;
    if header_pos == 0 && opts.verbose() && !opts.dry_run() {
        println!("Creating new archive {}", archive.display());
    }

    index.select(&opts.files, &opts.not, false);
    if !deleting {
        scan_external(&mut index, opts)?;
    }

    // What changes: files to compress, paths to mark deleted.
    let mut to_compress: Vec<String> = Vec::new();
    let mut deletions = 0u32;
    for (name, entry) in index.files.iter() {
        if entry.ext_date != 0
            && (opts.force
                || entry.versions.is_empty()
                || entry.ext_date != entry.versions.last().expect("nonempty").date)
        {
            to_compress.push(name.clone());
        }
        if entry.selected() && entry.ext_date == 0 && entry.is_live() {
            deletions += 1;
        }
    }
    to_compress.sort_by(|a, b| super::compress_order(a).cmp(&super::compress_order(b)));

    if to_compress.is_empty() && deletions == 0 {
        if opts.verbose() {
            println!(
                "Archive {} not updated: nothing to add or delete",
                archive.display()
            );
        }
        return Ok(0);
    }

    // Transaction date, bumped to keep the version log ordered.
    let mut tx_date = date::now()?;
    if let Some(last) = index.versions.last() {
        if last.date >= tx_date {
            let bumped = date::next_second(last.date);
            log::warn!(
                "adjusting date from {} to {}",
                date::to_string(tx_date),
                date::to_string(bumped)
            );
            tx_date = bumped;
        }
    }

    if opts.verbose() {
        println!(
            "Updating {} with {} additions and {} deletions at {}",
            archive.display(),
            to_compress.len(),
            deletions,
            date::to_string(tx_date)
        );
    }

    // Open the output, truncating leftovers past the append point.
    let sink = if opts.dry_run() {
        ArchiveSink::Counter(Arc::new(AtomicU64::new(0)))
    } else {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&archive)?;
        let len = file.metadata()?.len();
        if len != header_pos {
            if opts.verbose() {
                println!("Archive truncated from {len} to {header_pos} bytes");
            }
            file.set_len(header_pos)?;
        }
        file.seek(SeekFrom::Start(header_pos))?;
        ArchiveSink::File(file)
    };

    if method::is_streaming(&opts.method) {
        if deleting {
            return Err(Error::Config("delete needs a journaling method".into()));
        }
        return streaming_add(opts, &index, to_compress, sink, blocksize);
    }

    let mut total_in: u64 = 0;

    // Placeholder transaction header; the jump is patched afterwards.
    let frag_start = index.fragments.len();
    let mut header_block = Vec::new();
    scan::write_transaction_header(&mut header_block, tx_date, -1, frag_start, opts.fragile)?;
    let header_len = header_block.len() as u64;
    write_to_sink(&sink, &header_block)?;
    let header_end = header_pos + header_len;

    // Compress changed files into blocks.
    let mut dedup = DedupIndex::build(&index.fragments);
    if opts.verbose() {
        println!("Starting {} compression jobs", opts.threads);
    }
    let pipeline = CompressPipeline::new(opts.threads, sink.writer_handle()?, opts.fragile);

    let mut sb: Vec<u8> = Vec::with_capacity(blocksize / 4);
    let mut frags_in_block = 0usize;
    let mut analyzer = BlockAnalyzer::new();
    let map = opts.rename_map();

    let flush = |index: &mut crate::index::ArchiveIndex,
                     sb: &mut Vec<u8>,
                     frags_in_block: &mut usize,
                     analyzer: &mut BlockAnalyzer| {
        if *frags_in_block == 0 {
            return;
        }
        let first_id = index.fragments.len() - *frags_in_block;
        let type_tag = analyzer.block_type(sb.len());
        if opts.fragile {
            sb.extend_from_slice(&0u32.to_le_bytes());
            sb.extend_from_slice(&0u32.to_le_bytes());
        } else {
            for i in first_id..index.fragments.len() {
                sb.extend_from_slice(&(index.fragments[i].size as u32).to_le_bytes());
            }
            sb.extend_from_slice(&(first_id as u32).to_le_bytes());
            sb.extend_from_slice(&(*frags_in_block as u32).to_le_bytes());
        }
        let name = SegmentName {
            date: tx_date,
            kind: BlockKind::Data,
            id: first_id as u32,
        };
        pipeline.submit(BlockJob {
            data: std::mem::take(sb),
            filename: name.format(),
            method: opts.method.clone(),
            type_tag,
        });
        // Compressed size to be filled in from the writer's records.
        index.fragments[first_id].csize = -1;
        *frags_in_block = 0;
        analyzer.reset();
    };

    let mut fi = 0usize;
    let mut open_file: Option<(std::fs::File, usize)> = None; // file, index into to_compress
    loop {
        // Flush when out of input, when the block is full, or when a
        // stored-looking block is not worth growing further.
        let full = sb.len() > blocksize.saturating_sub(MAX_FRAGMENT + 80 + 4 * frags_in_block);
        let at_boundary = open_file.is_none();
        let next_size = to_compress
            .get(fi)
            .map(|n| index.files[n].ext_size.max(0) as usize)
            .unwrap_or(0);
        let wont_fit = at_boundary
            && sb.len() > blocksize * 3 / 4
            && sb.len() + next_size > blocksize.saturating_sub(MAX_FRAGMENT + 2048);
        let incompressible = at_boundary
            && ((sb.len() > blocksize / 8 && analyzer.redundancy < sb.len() as u64 / 32)
                || (sb.len() > blocksize / 4 && analyzer.redundancy < sb.len() as u64 / 16)
                || (sb.len() > blocksize / 2 && analyzer.redundancy < sb.len() as u64 / 8));
        if (fi == to_compress.len() && at_boundary) || full || wont_fit || incompressible {
            flush(&mut index, &mut sb, &mut frags_in_block, &mut analyzer);
            if fi == to_compress.len() && open_file.is_none() {
                break;
            }
            continue;
        }

        // Open the next file if none is in progress.
        if open_file.is_none() {
            let name = &to_compress[fi];
            let external = map.rename(name);
            if name.ends_with('/') {
                // Directory: recorded in the index only.
                if opts.quiet == 0 {
                    println!("Adding directory {name}");
                }
                fi += 1;
                continue;
            }
            match std::fs::File::open(&external) {
                Ok(f) => {
                    let entry = index.files.get_mut(name).expect("scanned");
                    if opts.shown(entry.ext_size) {
                        let verb = if entry.is_live() { "Updating" } else { "Adding" };
                        print!("{:6} {verb} {} {name}", index.fragments.len(), entry.ext_size);
                        if &external != name {
                            print!(" from {external}");
                        }
                        println!();
                    }
                    entry.new_frags.clear();
                    open_file = Some((f, fi));
                }
                Err(e) => {
                    log::warn!("{external}: {e}");
                    index.files.get_mut(name).expect("scanned").ext_date = 0;
                    fi += 1;
                    continue;
                }
            }
        }

        // Read one fragment, dedup it, and point the file at it.
        let (file, file_idx) = open_file.as_mut().expect("opened above");
        let before = sb.len();
        let frag = read_fragment(file, &mut sb)?;
        total_in += frag.size as u64;
        let id = {
            let found = dedup.find(&frag.sha1, &index.fragments);
            if found != 0 {
                sb.truncate(before);
                found
            } else {
                let id = index.fragments.len() as u32;
                index
                    .fragments
                    .push(Fragment::new(frag.sha1, frag.size as i64, 0));
                frags_in_block += 1;
                dedup.update(&index.fragments);
                analyzer.add_fragment(&frag);
                id
            }
        };
        let name = &to_compress[*file_idx];
        index
            .files
            .get_mut(name)
            .expect("scanned")
            .new_frags
            .push(id);

        if frag.eof {
            open_file = None;
            fi += 1;
        }
    }

    // Drain the pipeline and patch compressed sizes into the table.
    let (_writer_sink, csizes) = pipeline.finish()?;
    let mut j = 0usize;
    for i in frag_start..index.fragments.len() {
        if index.fragments[i].csize == -1 {
            index.fragments[i].csize = i64::from(csizes[j]);
            j += 1;
        }
    }
    debug_assert_eq!(j, csizes.len());
    let data_end = header_end + csizes.iter().map(|&c| u64::from(c)).sum::<u64>();
    let cdatasize = data_end - header_end;

    if opts.verbose() {
        println!(
            "Updating index with {} files, {} blocks, {} fragments",
            to_compress.len(),
            csizes.len(),
            index.fragments.len() - frag_start
        );
    }

    // Fragment tables: one h block per data block.
    let mut tail = Vec::new();
    let mut records: Vec<FragRecord> = Vec::new();
    let mut block_start = 0usize;
    let mut bsize = 0u32;
    for i in frag_start..=index.fragments.len() {
        let boundary = i == index.fragments.len() || index.fragments[i].csize != 0;
        if boundary && !records.is_empty() {
            let mut payload = Vec::new();
            format::write_frag_table(&mut payload, bsize, &records);
            let name = SegmentName {
                date: tx_date,
                kind: BlockKind::FragTable,
                id: block_start as u32,
            };
            method::compress_block(&mut tail, payload, "0", &name.format(), None, 0, opts.fragile)?;
            records.clear();
        }
        if i < index.fragments.len() {
            let f = &index.fragments[i];
            if f.csize != 0 {
                bsize = f.csize as u32;
                block_start = i;
            }
            records.push(FragRecord {
                sha1: f.sha1,
                size: f.size as u32,
            });
        }
    }

    // Index rows: deletions, then changed files, batched into i blocks.
    let mut rows: Vec<u8> = Vec::new();
    let mut i_count = 0u32;
    let names: Vec<String> = index.files.keys().cloned().collect();
    for (pos, name) in names.iter().enumerate() {
        let entry = &index.files[name];
        if entry.selected() && entry.ext_date == 0 && entry.is_live() {
            format::write_index_row(
                &mut rows,
                &IndexRow {
                    name: name.clone(),
                    date: 0,
                    attr: crate::attr::FileAttr::None,
                    frags: Vec::new(),
                },
            );
            if opts.shown(entry.versions.last().map_or(0, |v| v.size)) {
                println!("Removing {name}");
            }
        }
        if entry.ext_date != 0
            && (opts.force
                || entry.versions.is_empty()
                || entry.ext_date != entry.versions.last().expect("nonempty").date)
        {
            let last = entry.versions.last();
            let changed = last.map_or(true, |v| {
                entry.ext_date != v.date
                    || entry.ext_attr != v.attr
                    || entry.new_frags != v.frags
            });
            if changed {
                format::write_index_row(
                    &mut rows,
                    &IndexRow {
                        name: name.clone(),
                        date: entry.ext_date,
                        attr: entry.ext_attr,
                        frags: entry.new_frags.clone(),
                    },
                );
            }
        }
        if rows.len() > 16000 || (pos + 1 == names.len() && !rows.is_empty()) {
            i_count += 1;
            let name = SegmentName {
                date: tx_date,
                kind: BlockKind::Index,
                id: i_count,
            };
            method::compress_block(
                &mut tail,
                std::mem::take(&mut rows),
                "1",
                &name.format(),
                None,
                512,
                opts.fragile,
            )?;
        }
    }

    write_to_sink(&sink, &tail)?;

    // Back-patch the header with the real jump distance.
    let archive_end = match &sink {
        ArchiveSink::File(f) => {
            let mut f = f;
            let end = f.seek(SeekFrom::End(0))?;
            f.seek(SeekFrom::Start(header_pos))?;
            let mut patched = Vec::new();
            scan::write_transaction_header(&mut patched, tx_date, cdatasize as i64, frag_start, opts.fragile)?;
            if patched.len() as u64 != header_len {
                return Err(Error::format(
                    "transaction header changed size on rewrite",
                ));
            }
            f.write_all(&patched)?;
            f.sync_all()?;
            end
        }
        ArchiveSink::Counter(c) => header_pos + header_len + c.load(Ordering::Relaxed),
    };

    if opts.verbose() {
        println!(
            "{header_pos} + ({total_in} -> {header_len} + {cdatasize} + {} = {}) = {archive_end}",
            archive_end - data_end,
            archive_end - header_pos
        );
    }
    Ok(0)
}

fn write_to_sink(sink: &ArchiveSink, data: &[u8]) -> Result<()> {
    match sink {
        ArchiveSink::File(f) => {
            let mut f = f;
            f.write_all(data)?;
            Ok(())
        }
        ArchiveSink::Counter(c) => {
            c.fetch_add(data.len() as u64, Ordering::Relaxed);
            Ok(())
        }
    }
}

/// Streaming-mode add: no fragmentation, no dedup, no index blocks.
/// Each file becomes its own blocks with metadata in the segment
/// headers.
fn streaming_add(
    opts: &Options,
    index: &crate::index::ArchiveIndex,
    to_compress: Vec<String>,
    sink: ArchiveSink,
    blocksize: usize,
) -> Result<i32> {
    let map = opts.rename_map();
    let mut total_in = 0u64;
    for name in &to_compress {
        if name.ends_with('/') {
            continue;
        }
        let entry = &index.files[name];
        let external = map.rename(name);
        let mut file = match std::fs::File::open(&external) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("{external}: {e}");
                continue;
            }
        };
        let mut first = true;
        let mut buf = vec![0u8; blocksize];
        loop {
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 && !first {
                break;
            }
            total_in += filled as u64;
            let comment;
            let filename;
            if first {
                filename = name.clone();
                comment = format::streaming_comment(filled as u64, entry.ext_date, entry.ext_attr);
            } else {
                filename = String::new();
                comment = filled.to_string();
            }
            let mut block = Vec::new();
            method::compress_block(
                &mut block,
                buf[..filled].to_vec(),
                &opts.method,
                &filename,
                Some(&comment),
                512,
                opts.fragile,
            )?;
            write_to_sink(&sink, &block)?;
            if opts.shown(filled as i64) {
                println!("{name} {filled} bytes");
            }
            first = false;
            if filled < buf.len() {
                break;
            }
        }
    }
    if opts.verbose() {
        println!("streamed {total_in} input bytes");
    }
    Ok(0)
}
