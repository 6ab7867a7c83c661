//! Round-trip integration tests: add then extract reproduces the input
//! byte for byte, across methods, dedup, and selection options.

mod common;

use common::{noise, prose, Sandbox};
use jidac::format::{BlockKind, SegmentName};
use jidac::ops::{self, Options};
use jidac::zpaql::BlockReader;

#[test]
fn single_small_file() {
    let sb = Sandbox::new();
    sb.write("src/h.txt", b"hello\n");
    sb.add("1");
    sb.extract();
    sb.assert_extracted(&[("src/h.txt", b"hello\n")]);

    // The journal must hold exactly one of each block kind.
    let bytes = std::fs::read(sb.path("archive.zpaq")).expect("archive");
    let mut counts = [0u32; 4];
    let mut r = BlockReader::new(bytes.as_slice(), 0);
    while r.find_block().expect("scan") {
        while let Some(name) = r.find_filename().expect("segment") {
            r.read_comment().expect("comment");
            let seg = SegmentName::parse(&name).expect("journal name");
            counts[match seg.kind {
                BlockKind::Header => 0,
                BlockKind::Data => 1,
                BlockKind::FragTable => 2,
                BlockKind::Index => 3,
            }] += 1;
            r.read_segment_end().expect("segment end");
        }
    }
    assert_eq!(counts, [1, 1, 1, 1]);
}

#[test]
fn methods_roundtrip() {
    for method in ["0", "1", "2", "3", "4", "x4,1,4,0,3,20", "x4,3ci1"] {
        let sb = Sandbox::new();
        let text = prose(300);
        let mixed = {
            let mut v = noise(40_000, 5);
            v.extend_from_slice(&prose(100));
            v
        };
        sb.write("src/text.txt", &text);
        sb.write("src/mixed.bin", &mixed);
        sb.add(method);
        sb.extract();
        sb.assert_extracted(&[
            ("src/text.txt", text.as_slice()),
            ("src/mixed.bin", mixed.as_slice()),
        ]);
    }
}

#[test]
fn empty_and_tiny_files() {
    let sb = Sandbox::new();
    sb.write("src/empty", b"");
    sb.write("src/one", b"x");
    sb.write("src/sub/two", b"xy");
    sb.add("1");
    sb.extract();
    sb.assert_extracted(&[
        ("src/empty", b""),
        ("src/one", b"x"),
        ("src/sub/two", b"xy"),
    ]);
}

#[test]
fn duplicate_content_stored_once() {
    let sb = Sandbox::new();
    let payload = noise(300_000, 9);
    sb.write("src/a/copy1.bin", &payload);
    sb.write("src/b/copy2.bin", &payload);
    sb.add("1");

    let outcome =
        jidac::scan::read_archive(&sb.path("archive.zpaq"), jidac::ops::NO_UNTIL).expect("scan");
    let index = outcome.index;
    // Both files share every fragment id.
    let a = index.files.iter().find(|(n, _)| n.ends_with("copy1.bin")).unwrap().1;
    let b = index.files.iter().find(|(n, _)| n.ends_with("copy2.bin")).unwrap().1;
    let fa = &a.versions.last().unwrap().frags;
    let fb = &b.versions.last().unwrap().frags;
    assert!(!fa.is_empty());
    assert_eq!(fa, fb);
    // And the fragment table only holds one copy's worth.
    let total: i64 = index.fragments.iter().skip(1).map(|f| f.size.max(0)).sum();
    assert_eq!(total, payload.len() as i64);

    sb.extract();
    sb.assert_extracted(&[
        ("src/a/copy1.bin", payload.as_slice()),
        ("src/b/copy2.bin", payload.as_slice()),
    ]);
}

#[test]
fn adding_twice_appends_no_data() {
    let sb = Sandbox::new();
    sb.write("src/stable.txt", &prose(500));
    sb.add("1");
    let frags_before = jidac::scan::read_archive(&sb.path("archive.zpaq"), jidac::ops::NO_UNTIL)
        .expect("scan")
        .index
        .fragment_count();
    // Unchanged dates: the second add records nothing new.
    sb.add("1");
    let after = jidac::scan::read_archive(&sb.path("archive.zpaq"), jidac::ops::NO_UNTIL)
        .expect("scan");
    assert_eq!(after.index.fragment_count(), frags_before);
}

#[test]
fn selection_and_exclusion() {
    let sb = Sandbox::new();
    sb.write("src/keep/a.txt", b"keep a");
    sb.write("src/keep/b.txt", b"keep b");
    sb.write("src/drop/c.txt", b"drop c");
    let mut opts = sb.add_opts("1");
    opts.not = vec![sb.path_str("src/drop")];
    assert_eq!(ops::add(&opts, false).expect("add"), 0);

    sb.extract();
    sb.assert_extracted(&[
        ("src/keep/a.txt", b"keep a"),
        ("src/keep/b.txt", b"keep b"),
    ]);
    assert!(!sb.out_path("src/drop/c.txt").exists());
}

#[test]
fn wildcard_selection_on_extract() {
    let sb = Sandbox::new();
    sb.write("src/one.txt", b"one");
    sb.write("src/two.dat", b"two");
    sb.add("1");

    // Select only *.txt; extract back in place over the originals.
    let mut opts = sb.extract_opts();
    opts.files = vec![format!("{}/*.txt", sb.path_str("src"))];
    opts.to = vec![];
    opts.force = true;
    assert_eq!(ops::extract(&opts).expect("extract"), 0);
    assert_eq!(sb.read("src/one.txt"), b"one");
}

#[test]
fn mtime_restored_to_the_second() {
    let sb = Sandbox::new();
    sb.write("src/dated.txt", b"dated content");
    let old = filetime::FileTime::from_unix_time(1_500_000_000, 0);
    filetime::set_file_mtime(sb.path("src/dated.txt"), old).expect("set mtime");
    sb.add("1");
    sb.extract();
    assert_eq!(common::mtime_secs(&sb.out_path("src/dated.txt")), 1_500_000_000);
}

#[cfg(unix)]
#[test]
fn unix_mode_restored() {
    use std::os::unix::fs::PermissionsExt;
    let sb = Sandbox::new();
    sb.write("src/script.sh", b"#!/bin/sh\nexit 0\n");
    std::fs::set_permissions(
        sb.path("src/script.sh"),
        std::fs::Permissions::from_mode(0o755),
    )
    .expect("chmod");
    sb.add("1");
    sb.extract();
    let mode = std::fs::metadata(sb.out_path("src/script.sh"))
        .expect("stat")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn refuses_to_clobber_without_force() {
    let sb = Sandbox::new();
    sb.write("src/f.txt", b"archived");
    sb.add("1");
    sb.write("out/f.txt", b"precious");
    let mut opts = sb.extract_opts();
    opts.to = vec![sb.path_str("out")];
    opts.files = vec![sb.path_str("src")];
    // Map src -> out so the existing file collides.
    assert!(ops::extract(&opts).is_err());
    assert_eq!(sb.read("out/f.txt"), b"precious");

    opts.force = true;
    assert_eq!(ops::extract(&opts).expect("forced extract"), 0);
    assert_eq!(sb.read("out/f.txt"), b"archived");
}

#[test]
fn dry_run_writes_nothing() {
    let sb = Sandbox::new();
    sb.write("src/f.txt", &prose(100));
    let mut opts = sb.add_opts("1");
    opts.archive = String::new();
    assert_eq!(ops::add(&opts, false).expect("dry run"), 0);
    assert!(!sb.path("archive.zpaq").exists());
}

#[test]
fn streaming_method_roundtrip() {
    let sb = Sandbox::new();
    let data = prose(400);
    sb.write("src/stream.txt", &data);
    sb.add("s4,0");
    sb.extract();
    sb.assert_extracted(&[("src/stream.txt", data.as_slice())]);
}

#[test]
fn fragile_archive_roundtrips() {
    let sb = Sandbox::new();
    let data = prose(200);
    sb.write("src/frag.txt", &data);
    let mut opts = sb.add_opts("1");
    opts.fragile = true;
    assert_eq!(ops::add(&opts, false).expect("add"), 0);
    let mut xopts = sb.extract_opts();
    xopts.fragile = true;
    assert_eq!(ops::extract(&xopts).expect("extract"), 0);
    sb.assert_extracted(&[("src/frag.txt", data.as_slice())]);
}

#[test]
fn test_command_passes_on_clean_archive() {
    let sb = Sandbox::new();
    sb.write("src/ok.txt", &prose(300));
    sb.write("src/ok2.bin", &noise(50_000, 3));
    sb.add("2");
    let opts = Options {
        archive: sb.path_str("archive"),
        quiet: i64::MAX,
        threads: 2,
        ..Options::default()
    };
    assert_eq!(ops::test(&opts).expect("test"), 0);
}

#[test]
fn list_runs_on_archive() {
    let sb = Sandbox::new();
    sb.write("src/listed.txt", &prose(50));
    sb.add("1");
    let mut opts = Options {
        archive: sb.path_str("archive"),
        quiet: 0,
        ..Options::default()
    };
    assert_eq!(ops::list(&opts).expect("list"), 0);
    opts.all = true;
    assert_eq!(ops::list(&opts).expect("list all"), 0);
    opts.summary = 10;
    assert_eq!(ops::list(&opts).expect("summary"), 0);
}
