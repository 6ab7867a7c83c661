//! Shared helpers for the integration tests.
//!
//! Each test works in its own temp directory: a `src/` tree to archive,
//! the archive file itself, and an `out/` tree for extraction.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use jidac::ops::{self, Options};

pub struct Sandbox {
    pub dir: tempfile::TempDir,
}

impl Sandbox {
    pub fn new() -> Sandbox {
        Sandbox {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn path_str(&self, rel: &str) -> String {
        self.path(rel).to_string_lossy().into_owned()
    }

    /// Writes a file under the sandbox, creating parent directories.
    pub fn write(&self, rel: &str, data: &[u8]) {
        let p = self.path(rel);
        fs::create_dir_all(p.parent().expect("has parent")).expect("mkdir");
        fs::write(p, data).expect("write test file");
    }

    pub fn read(&self, rel: &str) -> Vec<u8> {
        fs::read(self.path(rel)).expect("read extracted file")
    }

    /// Options preset: quiet, archiving `src/` into `archive.zpaq`.
    pub fn add_opts(&self, method: &str) -> Options {
        Options {
            archive: self.path_str("archive"),
            files: vec![self.path_str("src")],
            quiet: i64::MAX,
            method: method.into(),
            threads: 2,
            ..Options::default()
        }
    }

    /// Options preset: extract everything into `out/`.
    pub fn extract_opts(&self) -> Options {
        Options {
            archive: self.path_str("archive"),
            files: vec![self.path_str("src")],
            to: vec![self.path_str("out")],
            quiet: i64::MAX,
            threads: 2,
            ..Options::default()
        }
    }

    pub fn add(&self, method: &str) {
        let code = ops::add(&self.add_opts(method), false).expect("add");
        assert_eq!(code, 0, "add failed");
    }

    pub fn extract(&self) {
        let code = ops::extract(&self.extract_opts()).expect("extract");
        assert_eq!(code, 0, "extract reported missing fragments");
    }

    /// Extracted twin of a source path (src/... -> out/...).
    pub fn out_path(&self, rel: &str) -> PathBuf {
        let tail = rel.strip_prefix("src").expect("source-relative path");
        PathBuf::from(format!("{}{}", self.path_str("out"), tail))
    }

    /// Asserts the extracted tree matches the given files exactly.
    pub fn assert_extracted(&self, files: &[(&str, &[u8])]) {
        for (rel, data) in files {
            let out = self.out_path(rel);
            let got = fs::read(&out)
                .unwrap_or_else(|e| panic!("missing extracted file {}: {e}", out.display()));
            assert_eq!(&got, data, "content mismatch for {rel}");
        }
    }
}

/// Deterministic pseudo-random bytes.
pub fn noise(len: usize, mut seed: u32) -> Vec<u8> {
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
        v.push((seed >> 16) as u8);
    }
    v
}

/// Compressible filler: repeated text with a counter.
pub fn prose(paragraphs: usize) -> Vec<u8> {
    let mut v = Vec::new();
    for i in 0..paragraphs {
        v.extend_from_slice(b"A journaling archive appends each update as a transaction. ");
        v.extend_from_slice(format!("Paragraph {i}.\n").as_bytes());
    }
    v
}

/// File modification time in whole seconds.
pub fn mtime_secs(path: &Path) -> i64 {
    fs::metadata(path)
        .expect("stat")
        .modified()
        .expect("mtime")
        .duration_since(std::time::UNIX_EPOCH)
        .expect("after epoch")
        .as_secs() as i64
}
