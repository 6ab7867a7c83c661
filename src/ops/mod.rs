//! The archive commands: add/delete, extract, list, test.
//!
//! Each command scans the archive into the in-memory model, marks the
//! entries selected by the path arguments, and runs as one transaction
//! over the model. Shared state here: the resolved options, the console
//! (whose verbosity is a *size threshold*: messages about files smaller
//! than `quiet` are dropped), and the external directory walk.

mod add;
mod extract;
mod list;
mod test;

pub use add::add;
pub use extract::extract;
pub use list::list;
pub use test::test;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::attr::FileAttr;
use crate::date;
use crate::error::{Error, Result};
use crate::index::ArchiveIndex;
use crate::path::RenameMap;

/// Suppress everything.
pub const MAX_QUIET: i64 = i64::MAX;

/// `--until` default: higher than any version count, lower than any date,
/// so nothing is rolled back.
pub const NO_UNTIL: i64 = 9_999_999_999_999;

/// Resolved command options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Archive path; empty = dry run (compress to a counter).
    pub archive: String,
    /// Positional path arguments (internal form).
    pub files: Vec<String>,
    /// `--to` rename targets.
    pub to: Vec<String>,
    /// `--not` exclusions.
    pub not: Vec<String>,
    /// Version number or date limit.
    pub until: i64,
    /// Re-add unchanged files / clobber on extract.
    pub force: bool,
    /// Size threshold below which progress lines are dropped.
    pub quiet: i64,
    /// Worker threads (resolved, ≥ 1).
    pub threads: usize,
    /// Omit checksums, tags, and recovery trailers.
    pub fragile: bool,
    /// Compression method string.
    pub method: String,
    /// `list --summary` row count (0 = off).
    pub summary: usize,
    /// `list --since` first version (negative = last N updates).
    pub since: i64,
    /// List every version, not just the latest.
    pub all: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            archive: String::new(),
            files: Vec::new(),
            to: Vec::new(),
            not: Vec::new(),
            until: NO_UNTIL,
            force: false,
            quiet: 0,
            threads: default_threads(),
            fragile: false,
            method: "1".into(),
            summary: 0,
            since: 0,
            all: false,
        }
    }
}

/// Detected hardware parallelism.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Options {
    /// Archive path with the `.zpaq` suffix applied.
    pub fn archive_path(&self) -> PathBuf {
        PathBuf::from(with_zpaq_suffix(&self.archive))
    }

    /// True for the write-nothing dry run.
    pub fn dry_run(&self) -> bool {
        self.archive.is_empty()
    }

    /// The `--to` prefix mapping.
    pub fn rename_map(&self) -> RenameMap {
        RenameMap::new(&self.files, &self.to)
    }

    /// True if a message about `size` bytes should be shown.
    pub fn shown(&self, size: i64) -> bool {
        self.quiet <= size
    }

    /// True unless all progress output is suppressed.
    pub fn verbose(&self) -> bool {
        self.quiet < MAX_QUIET
    }
}

/// Appends `.zpaq` unless already present (or the name is empty).
pub fn with_zpaq_suffix(name: &str) -> String {
    if name.is_empty() || name.ends_with(".zpaq") {
        name.to_string()
    } else {
        format!("{name}.zpaq")
    }
}

/// Where compressed bytes go: a real archive or a byte counter.
pub enum ArchiveSink {
    /// The archive file, positioned at the append point.
    File(File),
    /// Dry run byte counter.
    Counter(Arc<AtomicU64>),
}

impl ArchiveSink {
    /// A `Write` handle for the writer thread sharing this sink.
    pub fn writer_handle(&self) -> Result<Box<dyn Write + Send>> {
        match self {
            ArchiveSink::File(f) => Ok(Box::new(f.try_clone()?)),
            ArchiveSink::Counter(c) => Ok(Box::new(CounterWriter(c.clone()))),
        }
    }
}

struct CounterWriter(Arc<AtomicU64>);

impl Write for CounterWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Walks the external paths named by the arguments and records each file
/// and directory in the index as candidates for this update.
///
/// Directory entries get a trailing `/`. Symlinks and special files are
/// skipped. Paths are stored in internal (unrenamed, forward-slash)
/// form.
pub fn scan_external(index: &mut ArchiveIndex, opts: &Options) -> Result<()> {
    let map = opts.rename_map();
    if opts.verbose() && !opts.files.is_empty() {
        println!("Scanning files");
    }
    for pattern in &opts.files {
        let external = map.rename(pattern);
        let root = Path::new(&external);
        if !root.exists() {
            log::warn!("{external}: not found");
            continue;
        }
        for entry in walkdir::WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("scan error under {external}: {e}");
                    continue;
                }
            };
            let ftype = entry.file_type();
            if !ftype.is_file() && !ftype.is_dir() {
                continue;
            }
            let mut name = crate::path::normalize(&entry.path().to_string_lossy());
            if ftype.is_dir() && !name.ends_with('/') {
                name.push('/');
            }
            let internal = map.unrename(&name);
            if opts.not.iter().any(|p| crate::path::is_prefix(p, &internal)) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("{name}: {e}");
                    continue;
                }
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let record = index.files.entry(internal).or_default();
            record.ext_date = date::from_unix(mtime);
            record.ext_size = if ftype.is_dir() { 0 } else { meta.len() as i64 };
            record.ext_attr = FileAttr::from_metadata(&meta);
            record.written = 0;
        }
    }
    Ok(())
}

/// Creates every directory on the way to `path` (which uses forward
/// slashes), ignoring failures on segments that already exist.
pub fn make_parent_dirs(path: &str) {
    if let Some(end) = path.rfind('/') {
        let dir = &path[..end];
        if !dir.is_empty() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                log::warn!("creating {dir}: {e}");
            }
        }
    }
}

/// Restores a file's stored date and attributes after extraction.
pub fn restore_metadata(path: &str, date: i64, attr: FileAttr) {
    if date > 0 {
        let secs = date::to_unix(date);
        let ft = filetime::FileTime::from_unix_time(secs, 0);
        if let Err(e) = filetime::set_file_mtime(path, ft) {
            log::warn!("setting mtime of {path}: {e}");
        }
    }
    #[cfg(unix)]
    if let FileAttr::Unix(mode) = attr {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            log::warn!("setting permissions of {path}: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = attr;
}

/// Sorting key for files to be compressed: extension first so alike
/// content lands in the same blocks, then the path.
pub fn compress_order(name: &str) -> (String, &str) {
    let ext = name
        .rsplit('/')
        .next()
        .and_then(|base| base.rsplit_once('.'))
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    (ext, name)
}

/// Validates option combinations common to all commands.
pub fn check_options(opts: &Options) -> Result<()> {
    crate::method::validate(&opts.method)?;
    if opts.threads == 0 {
        return Err(Error::Config("thread count must be at least 1".into()));
    }
    Ok(())
}
