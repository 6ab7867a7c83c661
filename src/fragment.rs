//! Content-defined fragmentation.
//!
//! Input files are split into fragments at boundaries chosen by the data
//! itself, so that inserting bytes into a file moves only the boundaries
//! near the edit. The splitter keeps an order-1 prediction table `O1[prev]
//! → next` and a 32-bit rolling hash: a predicted byte multiplies the hash
//! by one odd constant, a miss by another, which drives the hash toward
//! zero in predictable regions. A boundary is declared when the hash drops
//! below 2^16 (at or past the minimum size) or at the maximum size.
//!
//! Each fragment is hashed with SHA-1 as it is read. The prediction table
//! and hit count of a finished fragment also feed [`BlockAnalyzer`], which
//! classifies whole blocks (text-ish, x86-ish, redundancy estimate) for
//! compression method selection.

use std::io::{self, Read};

use sha1::{Digest, Sha1};

/// Minimum fragment size in bytes.
pub const MIN_FRAGMENT: usize = 4096;
/// Maximum fragment size in bytes.
pub const MAX_FRAGMENT: usize = 520192;

const MULT_HIT: u32 = 314159265;
const MULT_MISS: u32 = 271828182;

/// One finished fragment.
pub struct FragmentData {
    /// Content hash.
    pub sha1: [u8; 20],
    /// Length in bytes (0 only at EOF on an empty tail).
    pub size: usize,
    /// Successful order-1 predictions while reading.
    pub hits: u32,
    /// Final order-1 table, input to [`BlockAnalyzer::add_fragment`].
    pub o1: [u8; 256],
    /// True if the input ended at this boundary.
    pub eof: bool,
}

/// Reads the next fragment of `input`, appending its bytes to `block`.
///
/// The prediction state starts fresh for every fragment; boundaries are a
/// function of the input bytes alone.
pub fn read_fragment<R: Read>(input: &mut R, block: &mut Vec<u8>) -> io::Result<FragmentData> {
    let mut o1 = [0u8; 256];
    let mut hash: u32 = 0;
    let mut prev: u8 = 0;
    let mut size = 0usize;
    let mut hits = 0u32;
    let mut sha1 = Sha1::new();
    let mut byte = [0u8; 1];
    let mut eof = false;
    loop {
        match input.read(&mut byte) {
            Ok(0) => {
                eof = true;
            }
            Ok(_) => {
                let c = byte[0];
                block.push(c);
                if c == o1[prev as usize] {
                    hash = hash.wrapping_add(u32::from(c) + 1).wrapping_mul(MULT_HIT);
                    hits += 1;
                } else {
                    hash = hash.wrapping_add(u32::from(c) + 1).wrapping_mul(MULT_MISS);
                }
                o1[prev as usize] = c;
                prev = c;
                sha1.update(byte);
                size += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if eof || (hash < 65536 && size >= MIN_FRAGMENT) || size >= MAX_FRAGMENT {
            break;
        }
    }
    Ok(FragmentData {
        sha1: sha1.finalize().into(),
        size,
        hits,
        o1,
        eof,
    })
}

/// Splits an in-memory buffer, returning the boundary offsets (exclusive).
/// Used by tests and by the recovery path when re-deriving fragments.
pub fn boundaries(data: &[u8]) -> Vec<usize> {
    let mut cuts = Vec::new();
    let mut cursor = io::Cursor::new(data);
    let mut sink = Vec::new();
    let mut pos = 0usize;
    loop {
        sink.clear();
        let f = read_fragment(&mut cursor, &mut sink).expect("in-memory read");
        if f.size == 0 {
            break;
        }
        pos += f.size;
        cuts.push(pos);
        if f.eof {
            break;
        }
    }
    cuts
}

/// Number of order-1 tables remembered for the cross-fragment match test.
const SAVED_TABLES: usize = 4;

/// Accumulates per-fragment statistics into a block classification.
///
/// The redundancy estimate of a fragment is the largest of four cheap
/// predictors: the order-1 hit count, the non-uniformity of the order-1
/// table, the fraction of never-seen bytes, and the match rate against the
/// tables of recent fragments.
pub struct BlockAnalyzer {
    o1_prev: [u8; 256 * SAVED_TABLES],
    /// New (non-duplicate) fragments in the current block.
    pub frags: u32,
    /// Fragments that looked like text.
    pub text: u32,
    /// Fragments that looked like x86 code.
    pub exe: u32,
    /// Estimated compressible bytes in the current block.
    pub redundancy: u64,
}

impl Default for BlockAnalyzer {
    fn default() -> Self {
        BlockAnalyzer::new()
    }
}

impl BlockAnalyzer {
    /// An analyzer with empty history.
    pub fn new() -> BlockAnalyzer {
        BlockAnalyzer {
            o1_prev: [0; 256 * SAVED_TABLES],
            frags: 0,
            text: 0,
            exe: 0,
            redundancy: 0,
        }
    }

    /// Records one new fragment. Duplicates (dedup hits) are not recorded.
    pub fn add_fragment(&mut self, frag: &FragmentData) {
        let sz = frag.size as i64;
        let mut text1: i32 = 0;
        let mut exe1: i32 = 0;
        let mut h1 = sz;
        let mut counts = [0u8; 256];
        for (i, &c) in frag.o1.iter().enumerate() {
            let n = counts[c as usize];
            if n < 255 {
                // 32768/((n+1)*204) is the expected share of a uniform table.
                h1 -= (sz * (32768 / ((i64::from(n) + 1) * 204))) >> 15;
                counts[c as usize] = n + 1;
            }
            let i = i as u8;
            if c == b' ' && (i.is_ascii_alphanumeric() || i == b'.' || i == b',') {
                text1 += 1;
            }
            if (1..32).contains(&c) && c != 9 && c != 10 && c != 13 {
                text1 -= 1;
            }
            if c == 0x8B {
                exe1 += 1;
            }
        }
        self.frags += 1;
        if exe1 >= 5 {
            self.exe += 1;
        }
        if text1 >= 5 {
            self.text += 1;
        }

        let mut best = i64::from(frag.hits);
        if sz > 0 {
            h1 = h1 * h1 / sz;
        }
        best = best.max(h1);
        best = best.max(i64::from(counts[0]) * sz / 256);
        let mut matches: i64 = 0;
        for (i, &p) in self.o1_prev.iter().enumerate() {
            matches += i64::from(p == frag.o1[i & 255]);
        }
        best = best.max(matches * sz / (256 * SAVED_TABLES) as i64);
        if frag.size >= MIN_FRAGMENT {
            self.o1_prev.copy_within(256.., 0);
            self.o1_prev[256 * (SAVED_TABLES - 1)..].copy_from_slice(&frag.o1);
        }
        self.redundancy += best.clamp(0, sz) as u64;
    }

    /// The type tag of the current block: redundancy score scaled to the
    /// block length in bits 2.., x86 in bit 1, text in bit 0.
    pub fn block_type(&self, block_len: usize) -> u32 {
        let score = self.redundancy / (block_len as u64 / 256 + 1);
        (score as u32) * 4
            + u32::from(self.exe > self.frags / 8) * 2
            + u32::from(self.text > self.frags / 4)
    }

    /// Clears the per-block counters after a flush. The saved order-1
    /// tables persist across blocks.
    pub fn reset(&mut self) {
        self.frags = 0;
        self.text = 0;
        self.exe = 0;
        self.redundancy = 0;
    }
}
