//! The ZPAQL virtual machine.
//!
//! A block header carries two byte-code programs: HCOMP, run once per
//! modeled byte to compute component contexts, and PCOMP, run once per
//! decoded byte to post-process (it receives 2^32-1 at end of segment).
//! The machine has four 32-bit registers A, B, C, D, a condition flag,
//! 256 saved registers R, a byte array M and a 32-bit array H, both sized
//! to powers of two and indexed modulo their size.
//!
//! [`Program`] is the validated header image; [`Vm`] adds the runtime
//! state. Program bytes are validated when parsed or assembled, so
//! execution only fails on genuinely unreachable corruption (an invalid
//! opcode or a wild long jump), which is reported rather than trusted.

use crate::error::{Error, Result};

use super::tables::COMPSIZE;

/// A validated COMP+HCOMP (or PCOMP) header image.
///
/// Layout matches the serialized form: two size bytes, five model
/// parameters (`hh hm ph pm n`), `n` component descriptors, a zero,
/// then the byte code at `hbegin..hend` with 128 spare bytes in between
/// so that relative jumps assembled near the front stay in range.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Header bytes; component list ends at `cend`, code is
    /// `hbegin..hend`.
    pub header: Vec<u8>,
    /// End of the component section.
    pub cend: usize,
    /// Start of byte code.
    pub hbegin: usize,
    /// End of byte code.
    pub hend: usize,
}

impl Program {
    /// True if a program image is present.
    pub fn is_present(&self) -> bool {
        self.header.len() > 6
    }

    /// Number of modeled components (0 = stored mode).
    pub fn component_count(&self) -> usize {
        if self.is_present() {
            self.header[6] as usize
        } else {
            0
        }
    }

    /// Parses a serialized header, validating the component section.
    pub fn parse(mut get: impl FnMut() -> Result<u8>) -> Result<Program> {
        let lo = get()? as usize;
        let hi = get()? as usize;
        let hsize = lo + (hi << 8);
        let mut header = vec![0u8; hsize + 300];
        header[0] = lo as u8;
        header[1] = hi as u8;
        let mut cend = 2;
        while cend < 7 {
            header[cend] = get()?;
            cend += 1;
        }
        let n = header[6] as usize;
        for _ in 0..n {
            let typ = get()?;
            let size = *COMPSIZE
                .get(typ as usize)
                .filter(|&&s| s > 0)
                .ok_or_else(|| Error::format(format!("invalid component type {typ}")))?;
            if cend + size as usize >= header.len() {
                return Err(Error::format("component list overflows header"));
            }
            header[cend] = typ;
            cend += 1;
            for _ in 1..size {
                header[cend] = get()?;
                cend += 1;
            }
        }
        if get()? != 0 {
            return Err(Error::format("missing COMP section terminator"));
        }
        header[cend] = 0;
        cend += 1;
        let hbegin = cend + 128;
        let mut hend = hbegin;
        if hsize + 129 <= hbegin {
            return Err(Error::format("header size too small for component list"));
        }
        while hend < hsize + 129 {
            if hend >= header.len() - 1 {
                return Err(Error::format("program overflows header"));
            }
            header[hend] = get()?;
            hend += 1;
        }
        if get()? != 0 {
            return Err(Error::format("missing HCOMP section terminator"));
        }
        header[hend] = 0;
        hend += 1;
        Ok(Program {
            header,
            cend,
            hbegin,
            hend,
        })
    }

    /// Serializes the header (size bytes, COMP section, code).
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header[..self.cend]);
        out.extend_from_slice(&self.header[self.hbegin..self.hend]);
    }

    /// The code section alone, as transmitted for a postprocessor.
    pub fn code(&self) -> &[u8] {
        &self.header[self.hbegin..self.hend]
    }
}

/// Power-of-two byte/word array with modulo indexing.
#[derive(Debug, Clone, Default)]
struct Ring<T> {
    data: Vec<T>,
}

impl<T: Default + Clone> Ring<T> {
    fn alloc(bits: usize) -> Result<Ring<T>> {
        if bits > 32 {
            return Err(Error::format("H or M too big"));
        }
        // Cap allocations at the format's real ceiling; a 4 GiB request on
        // a 32-bit usize is already an error upstream.
        let len = 1usize
            .checked_shl(bits as u32)
            .ok_or_else(|| Error::format("H or M too big"))?;
        Ok(Ring {
            data: vec![T::default(); len],
        })
    }

    #[inline]
    fn get(&self, i: u32) -> T {
        self.data[i as usize & (self.data.len() - 1)].clone()
    }

    #[inline]
    fn at(&mut self, i: u32) -> &mut T {
        let mask = self.data.len() - 1;
        &mut self.data[i as usize & mask]
    }
}

/// One running ZPAQL machine.
#[derive(Debug, Clone, Default)]
pub struct Vm {
    /// The program being run.
    pub prog: Program,
    m: Ring<u8>,
    h: Ring<u32>,
    r: Vec<u32>,
    a: u32,
    b: u32,
    c: u32,
    d: u32,
    f: bool,
    pc: usize,
    /// Bytes emitted by `out` instructions since the last drain.
    pub out: Vec<u8>,
}

impl Vm {
    /// Creates a machine for `prog` sized by its HCOMP parameters
    /// (`hh`, `hm`).
    pub fn for_hcomp(prog: Program) -> Result<Vm> {
        let (hbits, mbits) = (prog.header[2] as usize, prog.header[3] as usize);
        Self::with_sizes(prog, hbits, mbits)
    }

    /// Creates a machine for `prog` sized by its PCOMP parameters
    /// (`ph`, `pm`).
    pub fn for_pcomp(prog: Program) -> Result<Vm> {
        let (hbits, mbits) = (prog.header[4] as usize, prog.header[5] as usize);
        Self::with_sizes(prog, hbits, mbits)
    }

    fn with_sizes(prog: Program, hbits: usize, mbits: usize) -> Result<Vm> {
        if !prog.is_present() {
            return Err(Error::format("missing program header"));
        }
        Ok(Vm {
            prog,
            m: Ring::alloc(mbits)?,
            h: Ring::alloc(hbits)?,
            r: vec![0; 256],
            a: 0,
            b: 0,
            c: 0,
            d: 0,
            f: false,
            pc: 0,
            out: Vec::new(),
        })
    }

    /// Context value computed for component `i` by the last HCOMP run.
    #[inline]
    pub fn context(&self, i: usize) -> u32 {
        self.h.data[i & (self.h.data.len() - 1)]
    }

    /// Runs the program with `input` in A until `halt`.
    pub fn run(&mut self, input: u32) -> Result<()> {
        self.pc = self.prog.hbegin;
        self.a = input;
        loop {
            if !self.step()? {
                return Ok(());
            }
        }
    }

    #[inline]
    fn imm(&mut self) -> u32 {
        let v = self.prog.header[self.pc];
        self.pc += 1;
        u32::from(v)
    }

    /// Reads the value selected by the low 3 bits of an ALU opcode.
    #[inline]
    fn source(&mut self, sel: u8) -> u32 {
        match sel {
            0 => self.a,
            1 => self.b,
            2 => self.c,
            3 => self.d,
            4 => u32::from(self.m.get(self.b)),
            5 => u32::from(self.m.get(self.c)),
            6 => self.h.get(self.d),
            _ => self.imm(),
        }
    }

    fn jump(&mut self, taken: bool) {
        let off = i32::from(self.prog.header[self.pc] as i8);
        if taken {
            self.pc = (self.pc as i32 + off + 1) as usize;
        } else {
            self.pc += 1;
        }
    }

    fn bad_op(&self, op: u8) -> Error {
        Error::format(format!(
            "ZPAQL execution error: op {op} at {}",
            self.pc - 1 - self.prog.hbegin
        ))
    }

    /// Executes one instruction; false after `halt`.
    fn step(&mut self) -> Result<bool> {
        let op = self.prog.header[self.pc];
        self.pc += 1;
        match op {
            1 => self.a = self.a.wrapping_add(1),
            2 => self.a = self.a.wrapping_sub(1),
            3 => self.a = !self.a,
            4 => self.a = 0,
            7 => {
                let i = self.imm();
                self.a = self.r[i as usize];
            }
            8 => std::mem::swap(&mut self.a, &mut self.b),
            9 => self.b = self.b.wrapping_add(1),
            10 => self.b = self.b.wrapping_sub(1),
            11 => self.b = !self.b,
            12 => self.b = 0,
            15 => {
                let i = self.imm();
                self.b = self.r[i as usize];
            }
            16 => std::mem::swap(&mut self.a, &mut self.c),
            17 => self.c = self.c.wrapping_add(1),
            18 => self.c = self.c.wrapping_sub(1),
            19 => self.c = !self.c,
            20 => self.c = 0,
            23 => {
                let i = self.imm();
                self.c = self.r[i as usize];
            }
            24 => std::mem::swap(&mut self.a, &mut self.d),
            25 => self.d = self.d.wrapping_add(1),
            26 => self.d = self.d.wrapping_sub(1),
            27 => self.d = !self.d,
            28 => self.d = 0,
            31 => {
                let i = self.imm();
                self.d = self.r[i as usize];
            }
            // Swaps with memory exchange only the low byte of A.
            32 => {
                let t = u32::from(*self.m.at(self.b));
                *self.m.at(self.b) = self.a as u8;
                self.a = (self.a & !0xff) | t;
            }
            33 => *self.m.at(self.b) = self.m.at(self.b).wrapping_add(1),
            34 => *self.m.at(self.b) = self.m.at(self.b).wrapping_sub(1),
            35 => *self.m.at(self.b) = !*self.m.at(self.b),
            36 => *self.m.at(self.b) = 0,
            39 => {
                let f = self.f;
                self.jump(f);
            }
            40 => {
                let t = u32::from(*self.m.at(self.c));
                *self.m.at(self.c) = self.a as u8;
                self.a = (self.a & !0xff) | t;
            }
            41 => *self.m.at(self.c) = self.m.at(self.c).wrapping_add(1),
            42 => *self.m.at(self.c) = self.m.at(self.c).wrapping_sub(1),
            43 => *self.m.at(self.c) = !*self.m.at(self.c),
            44 => *self.m.at(self.c) = 0,
            47 => {
                let f = self.f;
                self.jump(!f);
            }
            48 => {
                let t = *self.h.at(self.d);
                *self.h.at(self.d) = self.a;
                self.a = t;
            }
            49 => *self.h.at(self.d) = self.h.at(self.d).wrapping_add(1),
            50 => *self.h.at(self.d) = self.h.at(self.d).wrapping_sub(1),
            51 => *self.h.at(self.d) = !*self.h.at(self.d),
            52 => *self.h.at(self.d) = 0,
            55 => {
                let i = self.imm();
                self.r[i as usize] = self.a;
            }
            56 => return Ok(false),
            57 => self.out.push(self.a as u8),
            59 => {
                let mb = u32::from(self.m.get(self.b));
                self.a = self
                    .a
                    .wrapping_add(mb)
                    .wrapping_add(512)
                    .wrapping_mul(773);
            }
            60 => {
                let a = self.a;
                let hd = self.h.at(self.d);
                *hd = hd.wrapping_add(a).wrapping_add(512).wrapping_mul(773);
            }
            63 => self.jump(true),
            64..=119 => {
                let sel = op & 7;
                let v = self.source(sel);
                match op >> 3 {
                    8 => self.a = v,
                    9 => self.b = v,
                    10 => self.c = v,
                    11 => self.d = v,
                    12 => *self.m.at(self.b) = v as u8,
                    13 => *self.m.at(self.c) = v as u8,
                    _ => *self.h.at(self.d) = v,
                }
            }
            128..=239 => {
                let v = self.source(op & 7);
                let a = self.a;
                match op >> 3 {
                    16 => self.a = a.wrapping_add(v),
                    17 => self.a = a.wrapping_sub(v),
                    18 => self.a = a.wrapping_mul(v),
                    19 => self.a = if v == 0 { 0 } else { a / v },
                    20 => self.a = if v == 0 { 0 } else { a % v },
                    21 => self.a = a & v,
                    22 => self.a = a & !v,
                    23 => self.a = a | v,
                    24 => self.a = a ^ v,
                    25 => self.a = a << (v & 31),
                    26 => self.a = a >> (v & 31),
                    27 => self.f = a == v,
                    28 => self.f = a < v,
                    _ => self.f = a > v,
                }
            }
            255 => {
                let lo = self.imm() as usize;
                let hi = self.imm() as usize;
                self.pc = self.prog.hbegin + lo + (hi << 8);
                if self.pc >= self.prog.hend {
                    return Err(self.bad_op(op));
                }
            }
            _ => return Err(self.bad_op(op)),
        }
        Ok(true)
    }
}
