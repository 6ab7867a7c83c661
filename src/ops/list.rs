//! The `list` command: file listings, version table, and the summary
//! report of biggest files, directories, extensions, and dedup shares.

use std::collections::BTreeMap;

use crate::date;
use crate::error::Result;
use crate::index::ArchiveIndex;
use crate::scan;

use super::{check_options, Options};

/// Runs `list`. Returns the process exit code.
pub fn list(opts: &Options) -> Result<i32> {
    check_options(opts)?;
    let archive = opts.archive_path();
    let outcome = scan::read_archive(&archive, opts.until)?;
    let csize = outcome.end_offset;
    if csize == 0 {
        log::warn!("{}: empty or missing archive", archive.display());
        return Ok(1);
    }
    let mut index = outcome.index;

    if opts.summary > 0 {
        index.select(&opts.files, &opts.not, false);
        summary(&index, opts.summary, csize);
        list_versions(&index, csize);
        return Ok(0);
    }

    index.select(&opts.files, &opts.not, true);
    let since = if opts.since < 0 {
        opts.since + index.versions.len() as i64
    } else {
        opts.since
    };

    let mut shown = 0u64;
    let mut shown_bytes = 0i64;
    let mut live = 0u64;
    println!("\nVer  Date      Time (UT) Attr           Size File");
    println!("---- ---------- -------- ------ ------------ ----");
    for (name, entry) in index.files.iter() {
        if entry.selected() {
            for (vi, v) in entry.versions.iter().enumerate() {
                let is_last = vi + 1 == entry.versions.len();
                if i64::from(v.version) >= since
                    && v.size >= opts.quiet
                    && (opts.all || (is_last && v.date != 0))
                {
                    if v.date != 0 {
                        shown += 1;
                        shown_bytes += v.size;
                        println!(
                            "{:4} {} {} {:12} {name}",
                            v.version,
                            date::to_string(v.date),
                            v.attr,
                            v.size
                        );
                    } else {
                        println!("{:4} {:35} {name}", v.version, "Deleted");
                    }
                }
            }
        }
        if entry.is_live() {
            live += 1;
        }
    }
    println!("{shown} of {live} files shown. {shown_bytes} -> {csize}");
    list_versions(&index, csize);
    Ok(0)
}

/// Per-version table: date, last fragment, change counts, sizes.
fn list_versions(index: &ArchiveIndex, csize: u64) {
    println!(
        "\nVer Last frag Date      Time (UT) Files Deleted   Original MB  Compressed MB"
    );
    println!(
        "---- -------- ---------- -------- ------ ------ -------------- --------------"
    );
    for (i, v) in index.versions.iter().enumerate() {
        if i == 0 && v.updates == 0 && v.deletes == 0 && v.date == 0 && v.bytes == 0 {
            continue;
        }
        let next_offset = index
            .versions
            .get(i + 1)
            .map(|n| n.offset)
            .unwrap_or(csize as i64);
        let last_frag = index
            .versions
            .get(i + 1)
            .map(|n| n.first_fragment as usize - 1)
            .unwrap_or(index.fragments.len() - 1);
        println!(
            "{i:4} {last_frag:8} {} {:6} {:6} {:14.6} {:14.6}",
            date::to_string(v.date),
            v.updates,
            v.deletes,
            v.bytes as f64 / 1e6,
            (next_offset - v.offset) as f64 / 1e6
        );
    }
}

#[derive(Default, Clone, Copy)]
struct Tally {
    bytes: i64,
    count: u64,
}

impl Tally {
    fn add(&mut self, n: i64) {
        self.bytes += n;
        self.count += 1;
    }
}

/// The `--summary` report.
fn summary(index: &ArchiveIndex, top_n: usize, csize: u64) {
    println!("\nRank      Size (MB)     Files File, Directory/, or .Type");
    println!("---- -------------- --------- --------------------------");

    let mut top: BTreeMap<String, Tally> = BTreeMap::new();
    let mut frag_refs = vec![0u64; index.fragments.len()];
    let mut unknown_refs = 0u64;
    for (name, entry) in index.files.iter() {
        let Some(latest) = entry.latest() else { continue };
        if latest.date == 0 || !entry.selected() {
            continue;
        }
        top.entry(String::new()).or_default().add(latest.size);
        top.entry(name.clone()).or_default().add(latest.size);
        let mut ext_at = 0usize;
        for (i, c) in name.char_indices() {
            if c == '/' {
                top.entry(name[..i + 1].to_string()).or_default().add(latest.size);
                ext_at = 0;
            } else if c == '.' {
                ext_at = i;
            }
        }
        let ext_key = if ext_at > 0 {
            name[ext_at..].to_ascii_lowercase()
        } else {
            ".".to_string()
        };
        top.entry(ext_key).or_default().add(latest.size);
        for &p in &latest.frags {
            if let Some(r) = frag_refs.get_mut(p as usize) {
                *r += 1;
                if index.fragments[p as usize].size < 0 {
                    unknown_refs += 1;
                }
            }
        }
    }

    let mut ranked: Vec<(&String, &Tally)> = top.iter().collect();
    ranked.sort_by(|a, b| (-a.1.bytes, a.0).cmp(&(-b.1.bytes, b.0)));
    for (rank, (name, t)) in ranked.iter().take(top_n).enumerate() {
        println!(
            "{:4} {:14.6} {:9} {}",
            rank + 1,
            t.bytes as f64 / 1e6,
            t.count,
            if name.is_empty() { "(total)" } else { name }
        );
    }

    // Dedup shares: how many references each fragment has.
    println!("\nShares Fragments Deduplicated MB    Extracted MB");
    println!("------ --------- --------------- ---------------");
    let mut by_share: BTreeMap<u64, (Tally, Tally)> = BTreeMap::new();
    let mut total = (Tally::default(), Tally::default());
    let mut unknown_size = 0u64;
    for (i, f) in index.fragments.iter().enumerate().skip(1) {
        let refs = frag_refs[i].min(10);
        let e = by_share.entry(refs).or_default();
        e.0.add(f.size.max(0));
        e.1.add(f.size.max(0) * frag_refs[i] as i64);
        total.0.add(f.size.max(0));
        total.1.add(f.size.max(0) * frag_refs[i] as i64);
        if f.size < 0 {
            unknown_size += 1;
        }
    }
    for (share, (dedup, expanded)) in &by_share {
        let label = if *share == 10 {
            "   10+".to_string()
        } else {
            format!("{share:6}")
        };
        println!(
            "{label} {:9} {:15.6} {:15.6}",
            dedup.count,
            dedup.bytes as f64 / 1e6,
            expanded.bytes as f64 / 1e6
        );
    }
    println!(
        " Total {:9} {:15.6} {:15.6}",
        total.0.count,
        total.0.bytes as f64 / 1e6,
        total.1.bytes as f64 / 1e6
    );

    println!(
        "\n{unknown_refs} references to {unknown_size} of {} fragments have unknown size.",
        index.fragment_count()
    );

    // Block usage.
    let mut blocks = 0u64;
    let mut used_blocks = 0u64;
    let mut block_used = false;
    for (i, f) in index.fragments.iter().enumerate().skip(1) {
        if f.csize >= 0 {
            blocks += 1;
            used_blocks += u64::from(block_used);
            block_used = false;
        }
        block_used |= frag_refs[i] > 0;
    }
    used_blocks += u64::from(block_used);
    let total_bytes = top.get("").map_or(0, |t| t.bytes);
    print!(
        "{used_blocks} of {blocks} blocks used.\nCompression {:.6} -> {:.6} MB",
        total_bytes as f64 / 1e6,
        csize as f64 / 1e6
    );
    if total_bytes > 0 {
        print!(" (ratio {:.3}%)", csize as f64 * 100.0 / total_bytes as f64);
    }
    println!();
}
