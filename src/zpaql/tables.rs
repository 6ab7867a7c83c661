//! Fixed tables of the ZPAQL machine and the predictor.
//!
//! The numeric tables (logistic squash/stretch, bit-history state machine,
//! adaptation rates) are generated once at startup with integer arithmetic
//! only, so every build produces bit-identical archives. The instruction
//! tables mirror the ZPAQ spec: an opcode's number encodes its operand in
//! the low 3 bits (A, B, C, D, *B, *C, *D, immediate).

use std::sync::OnceLock;

/// Header bytes per component type, indexed by type code
/// (0 unused, CONST, CM, ICM, MATCH, AVG, MIX2, MIX, ISSE, SSE).
pub const COMPSIZE: [u8; 10] = [0, 2, 3, 2, 3, 4, 6, 6, 3, 5];

/// Component type codes.
pub mod comp {
    pub const CONST: u8 = 1;
    pub const CM: u8 = 2;
    pub const ICM: u8 = 3;
    pub const MATCH: u8 = 4;
    pub const AVG: u8 = 5;
    pub const MIX2: u8 = 6;
    pub const MIX: u8 = 7;
    pub const ISSE: u8 = 8;
    pub const SSE: u8 = 9;
}

/// Component names as they appear in config text, indexed by type code.
pub const COMPNAME: [&str; 10] = [
    "", "const", "cm", "icm", "match", "avg", "mix2", "mix", "isse", "sse",
];

/// Assembler token list. Indices 0..=255 are opcodes (empty = invalid);
/// indices past 255 are structure words handled by the assembler itself.
pub const OPCODELIST: [&str; 270] = [
    "error", "a++", "a--", "a!", "a=0", "", "", "a=r", //
    "b<>a", "b++", "b--", "b!", "b=0", "", "", "b=r", //
    "c<>a", "c++", "c--", "c!", "c=0", "", "", "c=r", //
    "d<>a", "d++", "d--", "d!", "d=0", "", "", "d=r", //
    "*b<>a", "*b++", "*b--", "*b!", "*b=0", "", "", "jt", //
    "*c<>a", "*c++", "*c--", "*c!", "*c=0", "", "", "jf", //
    "*d<>a", "*d++", "*d--", "*d!", "*d=0", "", "", "r=a", //
    "halt", "out", "", "hash", "hashd", "", "", "jmp", //
    "a=a", "a=b", "a=c", "a=d", "a=*b", "a=*c", "a=*d", "a=", //
    "b=a", "b=b", "b=c", "b=d", "b=*b", "b=*c", "b=*d", "b=", //
    "c=a", "c=b", "c=c", "c=d", "c=*b", "c=*c", "c=*d", "c=", //
    "d=a", "d=b", "d=c", "d=d", "d=*b", "d=*c", "d=*d", "d=", //
    "*b=a", "*b=b", "*b=c", "*b=d", "*b=*b", "*b=*c", "*b=*d", "*b=", //
    "*c=a", "*c=b", "*c=c", "*c=d", "*c=*b", "*c=*c", "*c=*d", "*c=", //
    "*d=a", "*d=b", "*d=c", "*d=d", "*d=*b", "*d=*c", "*d=*d", "*d=", //
    "", "", "", "", "", "", "", "", //
    "a+=a", "a+=b", "a+=c", "a+=d", "a+=*b", "a+=*c", "a+=*d", "a+=", //
    "a-=a", "a-=b", "a-=c", "a-=d", "a-=*b", "a-=*c", "a-=*d", "a-=", //
    "a*=a", "a*=b", "a*=c", "a*=d", "a*=*b", "a*=*c", "a*=*d", "a*=", //
    "a/=a", "a/=b", "a/=c", "a/=d", "a/=*b", "a/=*c", "a/=*d", "a/=", //
    "a%=a", "a%=b", "a%=c", "a%=d", "a%=*b", "a%=*c", "a%=*d", "a%=", //
    "a&=a", "a&=b", "a&=c", "a&=d", "a&=*b", "a&=*c", "a&=*d", "a&=", //
    "a&~a", "a&~b", "a&~c", "a&~d", "a&~*b", "a&~*c", "a&~*d", "a&~", //
    "a|=a", "a|=b", "a|=c", "a|=d", "a|=*b", "a|=*c", "a|=*d", "a|=", //
    "a^=a", "a^=b", "a^=c", "a^=d", "a^=*b", "a^=*c", "a^=*d", "a^=", //
    "a<<=a", "a<<=b", "a<<=c", "a<<=d", "a<<=*b", "a<<=*c", "a<<=*d", "a<<=", //
    "a>>=a", "a>>=b", "a>>=c", "a>>=d", "a>>=*b", "a>>=*c", "a>>=*d", "a>>=", //
    "a==a", "a==b", "a==c", "a==d", "a==*b", "a==*c", "a==*d", "a==", //
    "a<a", "a<b", "a<c", "a<d", "a<*b", "a<*c", "a<*d", "a<", //
    "a>a", "a>b", "a>c", "a>d", "a>*b", "a>*c", "a>*d", "a>", //
    "", "", "", "", "", "", "", "", //
    "", "", "", "", "", "", "", "lj", //
    "post", "pcomp", "end", "if", "ifnot", "else", "endif", "do", //
    "while", "until", "forever", "ifl", "ifnotl", "elsel", //
];

/// Structure-word indices in [`OPCODELIST`].
pub mod word {
    pub const LJ: usize = 255;
    pub const POST: usize = 256;
    pub const PCOMP: usize = 257;
    pub const END: usize = 258;
    pub const IF: usize = 259;
    pub const IFNOT: usize = 260;
    pub const ELSE: usize = 261;
    pub const ENDIF: usize = 262;
    pub const DO: usize = 263;
    pub const WHILE: usize = 264;
    pub const UNTIL: usize = 265;
    pub const FOREVER: usize = 266;
    pub const IFL: usize = 267;
    pub const IFNOTL: usize = 268;
    pub const ELSEL: usize = 269;
    pub const JT: usize = 39;
    pub const JF: usize = 47;
    pub const JMP: usize = 63;
}

/// Logistic curve samples at 1/16 steps of the stretch domain, 12-bit
/// range. Interpolated and scaled by 8 to build the 15-bit squash table.
const SQUASH_BASE: [i32; 33] = [
    1, 2, 3, 6, 10, 16, 27, 45, 73, 120, 194, 310, 488, 747, 1101, 1546, 2047, 2549, 2994, 3348,
    3607, 3785, 3901, 3975, 4024, 4055, 4074, 4086, 4093, 4096, 4098, 4099, 4100,
];

fn squash_raw(d: i32) -> i32 {
    if d >= 2047 {
        return 32767;
    }
    if d <= -2047 {
        return 8;
    }
    let w = d & 127;
    let i = ((d >> 7) + 16) as usize;
    let v = (SQUASH_BASE[i] * (128 - w) + SQUASH_BASE[i + 1] * w + 64) >> 7;
    (v * 8).min(32767)
}

/// Shared predictor tables.
pub struct Tables {
    /// p → squash(p), p in -2048..=2047 biased by 2048.
    pub squash: Vec<u16>,
    /// q → stretch(q), q in 0..=32767.
    pub stretch: Vec<i16>,
    /// CM adaptation rate by count.
    pub cm_rate: Vec<i32>,
    /// MATCH confidence by run length.
    pub match_rate: Vec<i32>,
    /// Bit-history transitions: `[next0, next1, n0, n1]` per state.
    pub states: Vec<[u8; 4]>,
}

/// Bound on one count given the other count (clamped to 4).
fn bound(other: u32) -> u32 {
    [41, 12, 5, 3, 2][other.min(4) as usize]
}

fn valid(n0: u32, n1: u32) -> bool {
    n0 <= bound(n1) && n1 <= bound(n0)
}

fn discount(n: u32) -> u32 {
    if n > 2 {
        n / 2 + 1
    } else {
        n
    }
}

fn advance(mut n0: u32, mut n1: u32, y: u32) -> (u32, u32) {
    if y == 1 {
        n1 += 1;
        n0 = discount(n0);
    } else {
        n0 += 1;
        n1 = discount(n1);
    }
    // Shrink the stale count until the pair is representable again; the
    // just-observed side only saturates at its own cap.
    loop {
        if n0 > bound(n1) {
            if y == 1 {
                n0 -= 1;
                continue;
            }
            n0 = bound(n1);
        }
        if n1 > bound(n0) {
            if y == 0 {
                n1 -= 1;
                continue;
            }
            n1 = bound(n0);
        }
        if valid(n0, n1) {
            return (n0, n1);
        }
    }
}

fn build_states() -> Vec<[u8; 4]> {
    let mut pairs: Vec<(u32, u32)> = Vec::new();
    for n0 in 0..=41u32 {
        for n1 in 0..=41u32 {
            if valid(n0, n1) {
                pairs.push((n0, n1));
            }
        }
    }
    // Initial state (0,0) must sort first.
    pairs.sort_by_key(|&(n0, n1)| (n0 + n1, n1));
    let id_of = |n0: u32, n1: u32| -> u8 {
        pairs
            .iter()
            .position(|&p| p == (n0, n1))
            .expect("transition target is a valid state") as u8
    };
    pairs
        .iter()
        .map(|&(n0, n1)| {
            let (z0, z1) = advance(n0, n1, 0);
            let (o0, o1) = advance(n0, n1, 1);
            [id_of(z0, z1), id_of(o0, o1), n0.min(255) as u8, n1.min(255) as u8]
        })
        .collect()
}

impl Tables {
    fn build() -> Tables {
        let squash: Vec<u16> = (0..4096).map(|i| squash_raw(i - 2048) as u16).collect();
        let mut stretch = vec![0i16; 32768];
        let mut next = 0usize;
        for x in -2047..=2047i32 {
            let p = squash_raw(x) as usize;
            for slot in stretch.iter_mut().take(p + 1).skip(next) {
                *slot = x as i16;
            }
            next = next.max(p + 1);
        }
        for slot in stretch.iter_mut().skip(next) {
            *slot = 2047;
        }
        let cm_rate: Vec<i32> = (0..1024).map(|i| (1 << 17) / (i * 2 + 3) * 2).collect();
        let mut match_rate = vec![0i32; 256];
        for (i, r) in match_rate.iter_mut().enumerate().skip(1) {
            *r = (2048 / i) as i32;
        }
        Tables {
            squash,
            stretch,
            cm_rate,
            match_rate,
            states: build_states(),
        }
    }

    /// The process-wide table set.
    pub fn get() -> &'static Tables {
        static TABLES: OnceLock<Tables> = OnceLock::new();
        TABLES.get_or_init(Tables::build)
    }

    /// squash: stretch domain -2048..2047 → probability 0..32767.
    #[inline]
    pub fn squash(&self, x: i32) -> i32 {
        i32::from(self.squash[(x.clamp(-2048, 2047) + 2048) as usize])
    }

    /// stretch: probability 0..32767 → stretch domain.
    #[inline]
    pub fn stretch(&self, p: i32) -> i32 {
        i32::from(self.stretch[p.clamp(0, 32767) as usize])
    }

    /// Next bit-history state.
    #[inline]
    pub fn next_state(&self, state: u8, y: i32) -> u8 {
        self.states[state as usize][(y & 1) as usize]
    }

    /// Initial CM probability of a bit-history state, 25-bit fixed point.
    #[inline]
    pub fn state_prior(&self, state: u8) -> u32 {
        let s = &self.states[state as usize];
        let n0 = u32::from(s[2]);
        let n1 = u32::from(s[3]);
        ((n1 * 2 + 1) << 22) / (n0 + n1 + 1)
    }

    /// Number of bit-history states in use.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }
}
