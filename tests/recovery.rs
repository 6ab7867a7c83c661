//! Damage and recovery: corrupted fragment tables are rebuilt from the
//! redundant trailers of intact data blocks; corrupted data is detected
//! by checksums and confined to the damaged block.

mod common;

use common::{prose, Sandbox};
use jidac::format::{BlockKind, SegmentName};
use jidac::ops::{self, Options};
use jidac::zpaql::BlockReader;

/// Locates every journal block: (kind, offset, end).
fn block_map(bytes: &[u8]) -> Vec<(BlockKind, u64, u64)> {
    let mut map = Vec::new();
    let mut r = BlockReader::new(bytes, 0);
    while r.find_block().expect("scan") {
        let start = r.block_offset();
        let mut kind = None;
        while let Some(name) = r.find_filename().expect("segment") {
            r.read_comment().expect("comment");
            if let Some(seg) = SegmentName::parse(&name) {
                kind = Some(seg.kind);
            }
            r.read_segment_end().expect("end");
        }
        if let Some(k) = kind {
            map.push((k, start, r.tell()));
        }
    }
    map
}

fn test_opts(sb: &Sandbox) -> Options {
    Options {
        archive: sb.path_str("archive"),
        quiet: i64::MAX,
        threads: 2,
        ..Options::default()
    }
}

#[test]
fn corrupt_fragment_table_fails_test_then_recovers() {
    let sb = Sandbox::new();
    let data = prose(2000);
    sb.write("src/doc.txt", &data);
    sb.add("1");

    let archive = sb.path("archive.zpaq");
    let mut bytes = std::fs::read(&archive).expect("read archive");
    let map = block_map(&bytes);
    let (_, h_start, h_end) = *map
        .iter()
        .find(|(k, _, _)| *k == BlockKind::FragTable)
        .expect("one fragment table");

    // Smash the table block's payload.
    for b in &mut bytes[h_start as usize + 40..h_end as usize - 4] {
        *b ^= 0x5A;
    }
    std::fs::write(&archive, &bytes).expect("write corrupted archive");

    // test reports the damage.
    assert_eq!(ops::test(&test_opts(&sb)).expect("test runs"), 1);

    // extract still reconstructs the content from the data block's
    // redundant trailer.
    sb.extract();
    sb.assert_extracted(&[("src/doc.txt", data.as_slice())]);
}

#[test]
fn corrupt_data_block_is_detected() {
    let sb = Sandbox::new();
    sb.write("src/a.txt", &prose(1500));
    sb.add("1");

    let archive = sb.path("archive.zpaq");
    let mut bytes = std::fs::read(&archive).expect("read archive");
    let map = block_map(&bytes);
    let (_, d_start, d_end) = *map
        .iter()
        .find(|(k, _, _)| *k == BlockKind::Data)
        .expect("one data block");

    let mid = (d_start + d_end) / 2;
    bytes[mid as usize] ^= 0xFF;
    std::fs::write(&archive, &bytes).expect("write corrupted archive");

    assert_eq!(ops::test(&test_opts(&sb)).expect("test runs"), 1);

    // Extraction reports the file as incomplete rather than writing
    // wrong bytes silently.
    let code = ops::extract(&sb.extract_opts()).expect("extract runs");
    assert_eq!(code, 1);
}

#[test]
fn undamaged_blocks_survive_neighboring_damage() {
    let sb = Sandbox::new();
    // Two adds give two independent transactions.
    sb.write("src/first.txt", &prose(1200));
    sb.add("1");
    sb.write("src/second.txt", &prose(900));
    sb.add("1");

    let archive = sb.path("archive.zpaq");
    let mut bytes = std::fs::read(&archive).expect("read archive");
    let map = block_map(&bytes);
    let data_blocks: Vec<_> = map
        .iter()
        .filter(|(k, _, _)| *k == BlockKind::Data)
        .collect();
    assert_eq!(data_blocks.len(), 2);
    // Corrupt only the second data block.
    let (_, start, end) = *data_blocks[1];
    let mid = (start + end) / 2;
    bytes[mid as usize] ^= 0xFF;
    std::fs::write(&archive, &bytes).expect("write");

    let code = ops::extract(&sb.extract_opts()).expect("extract runs");
    assert_eq!(code, 1, "second file should be reported damaged");
    // The first file extracted intact.
    assert_eq!(sb.read("out/first.txt"), prose(1200));
}

#[test]
fn truncated_transaction_is_ignored() {
    let sb = Sandbox::new();
    sb.write("src/whole.txt", &prose(600));
    sb.add("1");
    let good_len = std::fs::metadata(sb.path("archive.zpaq")).unwrap().len();

    sb.write("src/partial.txt", &prose(700));
    sb.add("1");

    // Chop the second transaction mid-way: the scan stops at the damage
    // and version 1 remains whole.
    let archive = sb.path("archive.zpaq");
    let bytes = std::fs::read(&archive).unwrap();
    std::fs::write(&archive, &bytes[..good_len as usize + 40]).unwrap();

    let outcome = jidac::scan::read_archive(&archive, jidac::ops::NO_UNTIL).expect("scan");
    assert_eq!(outcome.index.versions.len(), 2);
    sb.extract();
    assert_eq!(sb.read("out/whole.txt"), prose(600));
}
