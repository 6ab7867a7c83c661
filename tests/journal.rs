//! Versioning behavior: incremental updates, rollback, deletion
//! markers, and the strictly increasing version dates.

mod common;

use common::{noise, prose, Sandbox};
use jidac::ops::{self, Options};

fn scan(sb: &Sandbox) -> jidac::index::ArchiveIndex {
    jidac::scan::read_archive(&sb.path("archive.zpaq"), jidac::ops::NO_UNTIL)
        .expect("scan")
        .index
}

/// Rewrites a file's tail, keeping the head identical.
fn modify_tail(data: &mut [u8], tail: usize) {
    let n = data.len();
    for (i, b) in data[n - tail..].iter_mut().enumerate() {
        *b = (i * 31) as u8;
    }
}

#[test]
fn incremental_update_shares_fragments() {
    let sb = Sandbox::new();
    let mut data = noise(2_000_000, 77);
    sb.write("src/big.bin", &data);
    sb.add("1");
    let v1 = scan(&sb);
    let v1_frags = v1.fragment_count();
    assert!(v1_frags > 3);

    // Touch the last ~50 KB only; most fragments must be reused.
    modify_tail(&mut data, 50_000);
    sb.write("src/big.bin", &data);
    // Ensure the mtime actually changes even on coarse filesystems.
    filetime::set_file_mtime(
        sb.path("src/big.bin"),
        filetime::FileTime::from_unix_time(common::mtime_secs(&sb.path("src/big.bin")) + 2, 0),
    )
    .expect("bump mtime");
    sb.add("1");

    let v2 = scan(&sb);
    assert_eq!(v2.versions.len(), 3); // reserved + two updates
    let new_frags = v2.fragment_count() - v1_frags;
    assert!(
        new_frags * 10 <= v1_frags * 2,
        "expected >=80% reuse, got {new_frags} new of {v1_frags}"
    );
    // The updated file still reads back correctly.
    sb.extract();
    assert_eq!(sb.read("out/big.bin"), data);
}

#[test]
fn rollback_restores_first_version() {
    let sb = Sandbox::new();
    let original = prose(800);
    sb.write("src/doc.txt", &original);
    sb.add("1");

    let mut changed = original.clone();
    modify_tail(&mut changed, 200);
    sb.write("src/doc.txt", &changed);
    filetime::set_file_mtime(
        sb.path("src/doc.txt"),
        filetime::FileTime::from_unix_time(common::mtime_secs(&sb.path("src/doc.txt")) + 2, 0),
    )
    .expect("bump mtime");
    sb.add("1");

    // Latest extract sees the change.
    sb.extract();
    assert_eq!(sb.read("out/doc.txt"), changed);

    // Rolled back to version 1, the original returns.
    let mut opts = sb.extract_opts();
    opts.until = 1;
    opts.to = vec![sb.path_str("old")];
    assert_eq!(ops::extract(&opts).expect("rollback extract"), 0);
    assert_eq!(sb.read("old/doc.txt"), original);
}

#[test]
fn add_after_rollback_truncates() {
    let sb = Sandbox::new();
    sb.write("src/a.txt", b"version one");
    sb.add("1");
    let len1 = std::fs::metadata(sb.path("archive.zpaq")).unwrap().len();

    sb.write("src/a.txt", b"version two, longer");
    filetime::set_file_mtime(
        sb.path("src/a.txt"),
        filetime::FileTime::from_unix_time(common::mtime_secs(&sb.path("src/a.txt")) + 2, 0),
    )
    .unwrap();
    sb.add("1");
    assert!(std::fs::metadata(sb.path("archive.zpaq")).unwrap().len() > len1);

    // Re-adding with -until 1 rewinds history before appending.
    sb.write("src/a.txt", b"version three");
    filetime::set_file_mtime(
        sb.path("src/a.txt"),
        filetime::FileTime::from_unix_time(common::mtime_secs(&sb.path("src/a.txt")) + 4, 0),
    )
    .unwrap();
    let mut opts = sb.add_opts("1");
    opts.until = 1;
    assert_eq!(ops::add(&opts, false).expect("add -until"), 0);

    let index = scan(&sb);
    assert_eq!(index.versions.len(), 3); // version 1 + the new one
    sb.extract();
    assert_eq!(sb.read("out/a.txt"), b"version three");
}

#[test]
fn delete_marks_and_rollback_revives() {
    let sb = Sandbox::new();
    sb.write("src/gone.txt", b"do not lose me");
    sb.write("src/kept.txt", b"still here");
    sb.add("1");

    // Delete one path (no filesystem scan).
    let mut del = sb.add_opts("1");
    del.files = vec![sb.path_str("src/gone.txt")];
    assert_eq!(ops::add(&del, true).expect("delete"), 0);

    let index = scan(&sb);
    let entry = index
        .files
        .iter()
        .find(|(n, _)| n.ends_with("gone.txt"))
        .expect("entry kept in index")
        .1;
    assert_eq!(entry.versions.last().unwrap().date, 0, "deletion marker");

    // Latest extract omits it.
    sb.extract();
    assert!(!sb.out_path("src/gone.txt").exists());
    assert_eq!(sb.read("out/kept.txt"), b"still here");

    // Rolled back before the delete, it comes back.
    let mut opts = sb.extract_opts();
    opts.until = 1;
    opts.to = vec![sb.path_str("old")];
    assert_eq!(ops::extract(&opts).expect("rollback"), 0);
    assert_eq!(sb.read("old/gone.txt"), b"do not lose me");
}

#[test]
fn version_dates_strictly_increase() {
    let sb = Sandbox::new();
    for i in 0..3 {
        sb.write("src/tick.txt", format!("content {i}").as_bytes());
        filetime::set_file_mtime(
            sb.path("src/tick.txt"),
            filetime::FileTime::from_unix_time(1_600_000_000 + i, 0),
        )
        .unwrap();
        sb.add("1");
    }
    let index = scan(&sb);
    assert_eq!(index.versions.len(), 4);
    let dates: Vec<i64> = index.versions.iter().skip(1).map(|v| v.date).collect();
    assert!(
        dates.windows(2).all(|w| w[0] < w[1]),
        "dates not strictly increasing: {dates:?}"
    );
}

#[test]
fn until_by_date_selects_versions() {
    let sb = Sandbox::new();
    sb.write("src/d.txt", b"first");
    sb.add("1");
    let first_date = scan(&sb).versions[1].date;

    sb.write("src/d.txt", b"second");
    filetime::set_file_mtime(
        sb.path("src/d.txt"),
        filetime::FileTime::from_unix_time(common::mtime_secs(&sb.path("src/d.txt")) + 2, 0),
    )
    .unwrap();
    sb.add("1");

    let mut opts = sb.extract_opts();
    opts.until = first_date; // exact date of version 1
    opts.to = vec![sb.path_str("old")];
    assert_eq!(ops::extract(&opts).expect("extract"), 0);
    assert_eq!(sb.read("old/d.txt"), b"first");
}

#[test]
fn forced_readd_without_changes_adds_no_rows() {
    let sb = Sandbox::new();
    sb.write("src/same.txt", &prose(100));
    sb.add("1");
    let before = scan(&sb);
    let rows_before: usize = before
        .files
        .values()
        .map(|e| e.versions.len())
        .sum();

    let mut opts = sb.add_opts("1");
    opts.force = true;
    assert_eq!(ops::add(&opts, false).expect("forced add"), 0);

    let after = scan(&sb);
    let rows_after: usize = after.files.values().map(|e| e.versions.len()).sum();
    // Data was re-deduplicated; identical content and dates produce no
    // new index rows.
    assert_eq!(rows_before, rows_after);
    assert_eq!(before.fragment_count(), after.fragment_count());
}

#[test]
fn list_until_shows_old_state() {
    let sb = Sandbox::new();
    sb.write("src/v.txt", b"v1");
    sb.add("1");
    sb.write("src/extra.txt", b"added later");
    sb.add("1");

    let opts = Options {
        archive: sb.path_str("archive"),
        until: 1,
        quiet: i64::MAX,
        ..Options::default()
    };
    let outcome = jidac::scan::read_archive(&sb.path("archive.zpaq"), opts.until).expect("scan");
    assert_eq!(outcome.index.versions.len(), 2);
    assert!(
        !outcome.index.files.keys().any(|n| n.ends_with("extra.txt")),
        "extra.txt must be invisible at version 1"
    );
}
