//! Block and segment framing.
//!
//! A block is: an optional 13-byte locator tag, the bytes `zPQ`, a level
//! byte (1 or 2), a `\x01`, the serialized model header, then one or more
//! segments, then `\xff`. A segment is `\x01`, a NUL-terminated filename
//! (possibly empty), a NUL-terminated comment, a reserved zero, the coded
//! data, four zero bytes, and a trailer marker: `\xfd` plus a 20-byte
//! SHA-1 of the uncompressed output, or `\xfe` for none.
//!
//! [`write_block`] produces one complete single-segment block in memory.
//! [`BlockReader`] walks blocks and segments sequentially from any byte
//! offset, decoding fully, partially (up to a requested output size), or
//! not at all (skipping to the trailer), and can resynchronize on the
//! locator tag after damaged regions.

use std::io::Read;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

use super::coder::{encode_pcomp, ByteGet, Decoder, Encoder, PostProcessor};
use super::compiler::Compiled;
use super::vm::Program;

/// Locator tag preceding robust-mode blocks.
pub const LOCATOR_TAG: [u8; 13] = [
    0x37, 0x6b, 0x53, 0x74, 0xa0, 0x31, 0x83, 0xd3, 0x8c, 0xb2, 0x28, 0xb0, 0xd3,
];

/// Writes one block holding one segment.
///
/// `payload` is the (preprocessed) data to code; `sha1` is the hash of the
/// original data before preprocessing, omitted in fragile mode along with
/// the locator tag.
pub fn write_block(
    out: &mut Vec<u8>,
    model: &Compiled,
    filename: &str,
    comment: &str,
    payload: &[u8],
    sha1: Option<[u8; 20]>,
    tag: bool,
) -> Result<()> {
    if tag {
        out.extend_from_slice(&LOCATOR_TAG);
    }
    out.push(b'z');
    out.push(b'P');
    out.push(b'Q');
    out.push(if model.hcomp.component_count() == 0 && !model.pcomp.is_present() {
        1
    } else {
        2
    });
    out.push(1);
    model.hcomp.write_to(out);

    out.push(1);
    out.extend_from_slice(filename.as_bytes());
    out.push(0);
    out.extend_from_slice(comment.as_bytes());
    out.push(0);
    out.push(0);

    let mut enc = Encoder::new(model.hcomp.clone())?;
    encode_pcomp(&mut enc, out, &model.pcomp)?;
    for &b in payload {
        enc.compress(out, i32::from(b))?;
    }
    enc.compress(out, -1)?;

    out.extend_from_slice(&[0, 0, 0, 0]);
    match sha1 {
        Some(h) => {
            out.push(0xfd);
            out.extend_from_slice(&h);
        }
        None => out.push(0xfe),
    }
    out.push(0xff);
    Ok(())
}

/// Archive byte source: sequential reads plus cheap forward skips.
pub trait Source: Read {
    /// Skips `n` bytes. The default reads and discards; seekable
    /// sources override it.
    fn skip(&mut self, n: u64) -> std::io::Result<()> {
        let mut left = n;
        let mut scratch = [0u8; 1 << 13];
        while left > 0 {
            let want = scratch.len().min(left as usize);
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "skip past end of archive",
                ));
            }
            left -= got as u64;
        }
        Ok(())
    }
}

impl Source for &[u8] {}

impl<S: Source> Source for &mut S {
    fn skip(&mut self, n: u64) -> std::io::Result<()> {
        (**self).skip(n)
    }
}

impl Source for std::io::BufReader<std::fs::File> {
    fn skip(&mut self, n: u64) -> std::io::Result<()> {
        use std::io::Seek;
        self.seek(std::io::SeekFrom::Current(n as i64)).map(|_| ())
    }
}

struct CountingSource<R: Read> {
    src: R,
    pos: u64,
}

impl<R: Read> ByteGet for CountingSource<R> {
    fn get(&mut self) -> Result<i32> {
        let mut b = [0u8; 1];
        loop {
            match self.src.read(&mut b) {
                Ok(0) => return Ok(-1),
                Ok(_) => {
                    self.pos += 1;
                    return Ok(i32::from(b[0]));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Where the reader stands inside the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// Between blocks.
    Block,
    /// Between segments (after a header or a segment end).
    Segment,
    /// Inside a segment, before or during decoding.
    Data { decoded_any: bool, finished: bool },
}

/// Sequential reader over the blocks of an archive.
pub struct BlockReader<R: Source> {
    src: CountingSource<R>,
    state: ReaderState,
    model: Program,
    dec: Option<Decoder>,
    pp: Option<PostProcessor>,
    hasher: Sha1,
    block_start: u64,
    out_limit: usize,
}

impl<R: Source> BlockReader<R> {
    /// Wraps a source whose current position is `offset` archive bytes.
    pub fn new(src: R, offset: u64) -> BlockReader<R> {
        BlockReader {
            src: CountingSource { src, pos: offset },
            state: ReaderState::Block,
            model: Program::default(),
            dec: None,
            pp: None,
            hasher: Sha1::new(),
            block_start: offset,
            out_limit: usize::MAX,
        }
    }

    /// Current archive offset (bytes consumed so far plus the start
    /// offset).
    pub fn tell(&self) -> u64 {
        self.src.pos
    }

    /// Offset where the current block started (its tag, if tagged).
    pub fn block_offset(&self) -> u64 {
        self.block_start
    }

    /// Skips `n` raw archive bytes (a transaction jump). Only valid
    /// between segments.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.src.src.skip(n)?;
        self.src.pos += n;
        Ok(())
    }

    /// Caps the decoded output of one segment; exceeding it is an error
    /// rather than an allocation.
    pub fn set_output_limit(&mut self, limit: usize) {
        self.out_limit = limit;
    }

    /// The model header of the current block.
    pub fn model(&self) -> &Program {
        &self.model
    }

    fn get(&mut self) -> Result<i32> {
        self.src.get()
    }

    /// Advances to the next block header, scanning over garbage if needed.
    /// Returns false at clean end of input.
    pub fn find_block(&mut self) -> Result<bool> {
        // Accept an untagged block sitting exactly at the read position.
        let mut first = [0i32; 3];
        for (i, f) in first.iter_mut().enumerate() {
            *f = self.get()?;
            if *f < 0 {
                if i == 0 {
                    return Ok(false);
                }
                return Err(Error::format("truncated block header"));
            }
        }
        let direct = first == [i32::from(b'z'), i32::from(b'P'), i32::from(b'Q')];
        if !direct {
            // Scan for the 16-byte pattern tag + "zPQ".
            let mut pattern = [0u8; 16];
            pattern[..13].copy_from_slice(&LOCATOR_TAG);
            pattern[13..].copy_from_slice(b"zPQ");
            let mut window = [0u8; 16];
            let mut filled = 0usize;
            for (w, f) in window.iter_mut().zip(first.iter()) {
                *w = *f as u8;
                filled += 1;
            }
            loop {
                if filled >= 16 && window == pattern {
                    break;
                }
                let c = self.get()?;
                if c < 0 {
                    return Ok(false);
                }
                window.rotate_left(1);
                window[15] = c as u8;
                filled += 1;
            }
            self.block_start = self.tell() - 16;
        } else {
            self.block_start = self.tell() - 3;
        }

        let level = self.get()?;
        if level != 1 && level != 2 {
            return Err(Error::bad_block(self.block_start, "bad block level"));
        }
        if self.get()? != 1 {
            return Err(Error::bad_block(self.block_start, "bad block version"));
        }
        self.model = Program::parse(|| {
            let c = self.src.get()?;
            if c < 0 {
                Err(Error::format("truncated model header"))
            } else {
                Ok(c as u8)
            }
        })
        .map_err(|e| Error::bad_block(self.block_start, e.to_string()))?;
        self.dec = Some(Decoder::new(self.model.clone())?);
        self.pp = None;
        self.state = ReaderState::Segment;
        Ok(true)
    }

    /// Reads the next segment's filename, or None at end of block.
    pub fn find_filename(&mut self) -> Result<Option<String>> {
        debug_assert_eq!(self.state, ReaderState::Segment);
        match self.get()? {
            1 => {}
            255 => {
                self.state = ReaderState::Block;
                return Ok(None);
            }
            c if c < 0 => return Err(Error::format("unexpected end of archive")),
            _ => return Err(Error::bad_block(self.block_start, "bad segment marker")),
        }
        let mut name = Vec::new();
        loop {
            let c = self.get()?;
            if c < 0 {
                return Err(Error::format("unterminated segment filename"));
            }
            if c == 0 {
                break;
            }
            name.push(c as u8);
        }
        let name = String::from_utf8_lossy(&name).replace('\\', "/");
        Ok(Some(name))
    }

    /// Reads the segment comment and the reserved byte.
    pub fn read_comment(&mut self) -> Result<Vec<u8>> {
        let mut comment = Vec::new();
        loop {
            let c = self.get()?;
            if c < 0 {
                return Err(Error::format("unterminated segment comment"));
            }
            if c == 0 {
                break;
            }
            comment.push(c as u8);
        }
        if self.get()? != 0 {
            return Err(Error::bad_block(self.block_start, "bad segment header"));
        }
        self.state = ReaderState::Data {
            decoded_any: false,
            finished: false,
        };
        self.hasher = Sha1::new();
        Ok(comment)
    }

    /// Decodes segment data into `out`.
    ///
    /// With `want = Some(n)`, stops once at least `n` total bytes stand in
    /// `out` and reports `true` (more may remain); `None` decodes to end
    /// of segment. Returns `false` when the segment is exhausted.
    pub fn decompress(&mut self, want: Option<usize>, out: &mut Vec<u8>) -> Result<bool> {
        let (mut decoded_any, finished) = match self.state {
            ReaderState::Data {
                decoded_any,
                finished,
            } => (decoded_any, finished),
            _ => return Err(Error::format("decompress outside a segment")),
        };
        if finished {
            return Ok(false);
        }
        let dec = self.dec.as_mut().expect("in a block");
        if self.pp.is_none() {
            let (ph, pm) = if self.model.is_present() {
                (self.model.header[4], self.model.header[5])
            } else {
                (0, 0)
            };
            let mut pp = PostProcessor::new(ph, pm);
            while !pp.ready() {
                let c = dec.decompress(&mut self.src)?;
                pp.write(c)?;
            }
            self.pp = Some(pp);
        }
        let pp = self.pp.as_mut().expect("set above");
        let mut done = false;
        loop {
            let c = dec.decompress(&mut self.src)?;
            pp.write(c)?;
            decoded_any = true;
            if !pp.out.is_empty() {
                self.hasher.update(&pp.out);
                if out.len() + pp.out.len() > self.out_limit {
                    return Err(Error::TooBig("decompressed block".into()));
                }
                out.append(&mut pp.out);
            }
            if c < 0 {
                done = true;
                break;
            }
            if let Some(n) = want {
                if out.len() >= n {
                    break;
                }
            }
        }
        self.state = ReaderState::Data {
            decoded_any,
            finished: done,
        };
        Ok(!done)
    }

    /// SHA-1 of the output decoded so far in this segment.
    pub fn output_sha1(&self) -> [u8; 20] {
        self.hasher.clone().finalize().into()
    }

    /// Finishes the current segment, returning the stored SHA-1 trailer
    /// if present. Undecoded data is skipped without modeling.
    pub fn read_segment_end(&mut self) -> Result<Option<[u8; 20]>> {
        let marker = match self.state {
            ReaderState::Data { finished, .. } => {
                if finished {
                    self.get()?
                } else {
                    let dec = self.dec.as_mut().expect("in a block");
                    dec.skip_segment(&mut self.src)?
                }
            }
            _ => return Err(Error::format("segment end without segment")),
        };
        let result = match marker {
            0xfd => {
                let mut h = [0u8; 20];
                for b in h.iter_mut() {
                    let c = self.get()?;
                    if c < 0 {
                        return Err(Error::format("truncated segment trailer"));
                    }
                    *b = c as u8;
                }
                Some(h)
            }
            0xfe => None,
            _ => return Err(Error::bad_block(self.block_start, "bad segment trailer")),
        };
        self.state = ReaderState::Segment;
        Ok(result)
    }
}
