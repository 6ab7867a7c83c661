//! Compression method selection and configuration generation.
//!
//! A method string is either a digit `0..6` (store, fast LZ77, slow LZ77,
//! LZ77+CM, candidate race, race plus CM, heavy CM) or an explicit recipe
//! `x`/`s` followed by up to nine numeric arguments and component groups
//! (`c` context models, `i` ISSE chains, `a` match model, `m`/`t`/`s`
//! mixers, `w` word models). Digit methods are expanded here using the
//! block's type tag (an 8-bit fingerprint with a redundancy score in the
//! high bits, an x86 bit, and a text bit) before being turned into a
//! ZPAQL configuration.
//!
//! Levels 4 and 5 compress the block with several candidate recipes and
//! keep the smallest output. Level 6 additionally scans the block for
//! periodic structure and appends distance-context models for the two
//! strongest periods found.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::filter::lz77::lg;
use crate::format;
use crate::zpaql;

/// Default block size for a method string: what one data block may hold.
pub fn block_size(method: &str) -> usize {
    let mut bits = 24;
    let bytes = method.as_bytes();
    if let Some(&first) = bytes.first() {
        if first.is_ascii_digit() && first > b'1' {
            bits = 26;
        }
    }
    if method.len() > 1 {
        let digits: String = method[1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(n) = digits.parse::<u32>() {
            bits = 20 + n.min(11);
        }
    }
    (1usize << bits) - 4096
}

/// Checks the shape of a user-supplied method string.
pub fn validate(method: &str) -> Result<()> {
    let b = method.as_bytes();
    match b.first() {
        Some(b'0'..=b'6') | Some(b'x') | Some(b's') => Ok(()),
        _ => Err(Error::Config(format!(
            "method must be 0..6, x..., or s...: {method}"
        ))),
    }
}

/// True for the pre-journaling streaming format.
pub fn is_streaming(method: &str) -> bool {
    method.starts_with('s')
}

fn nbits(x: u32) -> i32 {
    x.count_ones() as i32
}

/// Compresses `input` into one block appended to `out`.
///
/// `type_tag` drives recipe selection for digit methods. `comment`
/// overrides the default journaling comment (used by streaming mode).
/// Returns the expanded method actually used.
pub fn compress_block(
    out: &mut Vec<u8>,
    input: Vec<u8>,
    method: &str,
    filename: &str,
    comment: Option<&str>,
    type_tag: u32,
    fragile: bool,
) -> Result<String> {
    let n = input.len();
    let arg0 = if method.len() > 1 {
        method[1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<i32>()
            .unwrap_or(0)
    } else {
        (lg(n as u32 + 4095) - 20).max(0)
    };

    let expanded = if method.as_bytes()[0].is_ascii_digit() {
        let level = (method.as_bytes()[0] - b'0') as i32;
        let doe8 = (type_tag & 2) as i32 * 2;
        let t = type_tag;
        let htsz = format!(",{}", 19 + arg0 + i32::from(arg0 <= 6));
        let base = format!("x{arg0}");
        match level {
            0 => format!("{base},0"),
            1 => {
                if t < 40 {
                    format!("{base},0")
                } else if t < 80 {
                    format!("{base},{},4,0,1,15", 1 + doe8)
                } else if t < 128 {
                    format!("{base},{},4,0,2,16", 1 + doe8)
                } else if t < 256 {
                    format!("{base},{},4,0,2{htsz}", 1 + doe8)
                } else {
                    format!("{base},{},5,0,3{htsz}", 1 + doe8)
                }
            }
            2 => {
                if t < 32 {
                    format!("{base},0")
                } else if t < 64 {
                    format!("{base},{},4,0,1,16", 1 + doe8)
                } else if t < 96 {
                    format!("{base},{},4,0,2{htsz}", 1 + doe8)
                } else if t < 128 {
                    format!("{base},{},4,0,3{htsz}", 1 + doe8)
                } else if t < 256 {
                    format!("{base},{},4,8,3{htsz}", 1 + doe8)
                } else {
                    format!("{base},{},4,8,4{htsz}", 1 + doe8)
                }
            }
            3 => {
                if t < 16 {
                    format!("{base},0")
                } else if t < 48 {
                    format!("{base},{},4,0,3{htsz}", 1 + doe8)
                } else {
                    format!("{base},{},8,0,4{htsz},c0,0,511", 2 + doe8)
                }
            }
            4 | 5 => {
                if t < 12 {
                    format!("{base},0")
                } else if t < 24 {
                    format!("{base},{},4,0,3{htsz},16,18", 1 + doe8)
                } else if t < 48 {
                    format!("{base},{},8,0,4{htsz},16,24c0,0,511", 2 + doe8)
                } else {
                    // Race the candidates; keep the smallest output.
                    let mut candidates =
                        vec![format!("{base},{},8,0,4{htsz},16,24c0,0,511", 2 + doe8)];
                    if n + 4096 <= 1 << 24 {
                        candidates.push(format!("x{},{}ci1", arg0.min(4), 3 + doe8));
                    }
                    if level == 5 {
                        let w = if t & 1 != 0 { "w" } else { "" };
                        candidates.push(format!("{base},{doe8}ci1,1,1,1,2a{w}m"));
                    }
                    let mut best: Option<(Vec<u8>, String)> = None;
                    for cand in candidates {
                        let mut buf = Vec::new();
                        let used = compress_block(
                            &mut buf,
                            input.clone(),
                            &cand,
                            filename,
                            comment,
                            type_tag,
                            fragile,
                        )?;
                        if best.as_ref().map_or(true, |(b, _)| buf.len() < b.len()) {
                            best = Some((buf, used));
                        }
                    }
                    let (buf, used) = best.expect("at least one candidate");
                    out.extend_from_slice(&buf);
                    return Ok(used);
                }
            }
            6 => {
                let mut m = format!("x{arg0},{doe8}");
                if t & 1 != 0 {
                    m.push_str("w2c0,1010,255i1");
                } else {
                    m.push_str("w1i1");
                }
                m.push_str("c256ci1,1,1,1,1,1,2a");
                // Scan for periodic structure: tally gaps between equal
                // bytes and model the strongest periods.
                const NR: usize = 1 << 12;
                let mut pt = [0i64; 256];
                let mut r = vec![0i64; NR];
                for (i, &c) in input.iter().enumerate() {
                    let k = i as i64 - pt[c as usize];
                    if k > 0 && (k as usize) < NR {
                        r[k as usize] += 1;
                    }
                    pt[c as usize] = i as i64;
                }
                let mut n1 = n as i64 - r[1] - r[2] - r[3];
                for _ in 0..2 {
                    let mut period = 0usize;
                    let mut score = 0.0f64;
                    let mut t_acc = 0i64;
                    for (j, &rj) in r.iter().enumerate().skip(5) {
                        if t_acc >= n1 {
                            break;
                        }
                        let s = rj as f64 / (256.0 + (n1 - t_acc) as f64);
                        if s > score {
                            score = s;
                            period = j;
                        }
                        t_acc += rj;
                    }
                    if period > 4 && score > 0.1 {
                        m.push_str(&format!("c0,0,{},255i1", 999 + period));
                        if period <= 255 {
                            m.push_str(&format!("c0,{period}i1"));
                        }
                        n1 -= r[period];
                        r[period] = 0;
                    } else {
                        break;
                    }
                }
                m.push_str("c0,2,0,255i1c0,3,0,0,255i1c0,4,0,0,0,255i1mm16ts19t0");
                m
            }
            _ => {
                return Err(Error::Config(format!("method level {level} out of range")));
            }
        }
    } else {
        method.to_string()
    };

    let sha1: Option<[u8; 20]> = if fragile {
        None
    } else {
        Some(Sha1::digest(&input).into())
    };

    let (config, args) = make_config(&expanded)?;
    if n + 4096 > 1usize << (20 + args[0].clamp(0, 11)) {
        return Err(Error::TooBig(format!("{n} byte block for method {expanded}")));
    }
    let compiled = zpaql::compile(&config, &args)?;

    let default_comment;
    let comment = match comment {
        Some(c) => c,
        None => {
            default_comment = if is_streaming(&expanded) {
                n.to_string()
            } else {
                format::journal_comment(n)
            };
            &default_comment
        }
    };

    let mut data = input;
    let payload = crate::filter::preprocess(&mut data, &args)?;
    zpaql::write_block(out, &compiled, filename, comment, &payload, sha1, !fragile)?;
    Ok(expanded)
}

/// Expands an `x`/`s` recipe into a ZPAQL configuration and its nine
/// numeric arguments.
pub fn make_config(method: &str) -> Result<(String, [i32; 9])> {
    let bytes = method.as_bytes();
    if bytes.is_empty() || (bytes[0] != b'x' && bytes[0] != b's') {
        return Err(Error::Config(format!("not an explicit method: {method}")));
    }

    // Numeric arguments with their conventional defaults.
    let mut args: [i32; 9] = [4, 1, 4, 0, 3, 24, 16, 18, 0];
    let mut pos = 1usize;
    if pos < bytes.len() && bytes[pos].is_ascii_digit() {
        args[0] = 0;
    }
    let mut argi = 0usize;
    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_digit() {
            args[argi] = args[argi] * 10 + i32::from(c - b'0');
        } else if c == b',' || c == b'.' {
            argi += 1;
            if argi >= 9 {
                pos += 1;
                break;
            }
            args[argi] = 0;
        } else {
            break;
        }
        pos += 1;
    }
    let rest = &method[pos..];

    let level = args[1] & 3;
    let doe8 = (4..=7).contains(&args[1]);
    let membits = args[0] + 20;

    let (hdr, pcomp) = match level {
        1 => (
            "comp 9 16 0 $1+20 ".to_string(),
            lz77_varlen_pcomp(if args[0] > 4 { args[0] - 4 } else { 0 }, doe8),
        ),
        2 => ("comp 9 16 0 $1+20 ".to_string(), lz77_byte_pcomp(doe8)),
        3 => {
            if args[0] > 4 {
                return Err(Error::Config(
                    "BWT blocks are limited to 16 MiB (size argument over 4)".into(),
                ));
            }
            ("comp 9 16 $1+20 $1+20 ".to_string(), bwt_pcomp(doe8))
        }
        0 => (
            "comp 9 16 0 0 ".to_string(),
            if doe8 {
                E8E9_PCOMP.to_string()
            } else {
                "end\n".to_string()
            },
        ),
        _ => return Err(Error::Config(format!("bad preprocessor code {}", args[1]))),
    };

    // Context-model components. H[0..n-1] hold component contexts,
    // H[255..511] the last position of each byte value, M the last 64K
    // bytes filled backward, C the most recent position.
    let mut ncomp = 0usize;
    let mut sb = 5i32;
    let mut comp = String::new();
    let mut hcomp = String::from("hcomp\nc-- *c=a a+= 255 d=a *d=c\n");
    if level == 2 {
        // Track the byte-aligned LZ77 parse in R1/R2 so contexts can
        // distinguish literals from match offsets.
        hcomp.push_str(
            "a=r 1 a== 0 if (init)\n",
        );
        hcomp.push_str(&format!("  a= {} (skip post code)\n", 111 + 57 * i32::from(doe8)));
        hcomp.push_str(
            "else a== 1 if  (new code?)\n\
             \x20 a=*c r=a 2  (save code in R2)\n\
             \x20 a> 63 if a>>= 6 a++ a++  (match)\n\
             \x20 else a++ a++ endif  (literal)\n\
             else (read rest of code)\n\
             \x20 a--\n\
             endif endif\n\
             r=a 1  (R1 = 1+expected bytes to next code)\n",
        );
    }

    let mut chars = rest.bytes().peekable();
    let read_nums = |chars: &mut std::iter::Peekable<std::str::Bytes<'_>>| -> Vec<i32> {
        let mut v = Vec::new();
        if chars.peek().map_or(false, |c| c.is_ascii_digit()) {
            v.push(0);
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    *v.last_mut().expect("nonempty") =
                        v.last().expect("nonempty") * 10 + i32::from(c - b'0');
                    chars.next();
                } else if c == b',' || c == b'.' {
                    v.push(0);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        v
    };

    while let Some(cmd) = chars.next() {
        if ncomp >= 254 {
            break;
        }
        let mut v = read_nums(&mut chars);
        match cmd {
            // cN1,N2,...: context model. N1 0 = ICM, 1..256 = CM with
            // limit N1-1. N2 selects a periodic (1..255) or distance
            // (1000..1255) context; further numbers are byte masks,
            // 256..511 the LZ77 parse state, 1000+ skips.
            b'c' => {
                while v.len() < 2 {
                    v.push(0);
                }
                comp.push_str(&format!("{ncomp} "));
                sb = 11;
                if v[1] < 256 {
                    sb += nbits(v[1] as u32);
                } else {
                    sb += 6;
                }
                if args[1] == 2 {
                    sb += 8;
                }
                for &x in v.iter().skip(2) {
                    if x < 512 {
                        sb += nbits(x as u32) * 3 / 4;
                    }
                }
                sb = sb.min(membits);
                if v[0] == 0 {
                    comp.push_str(&format!("icm {}\n", sb - 6));
                } else {
                    comp.push_str(&format!("cm {} {}\n", sb - 2, v[0] - 1));
                }

                hcomp.push_str(&format!("d= {ncomp} *d=0\n"));
                if v[1] > 1 && v[1] <= 255 {
                    // Periodic context.
                    if lg(v[1] as u32) != lg(v[1] as u32 - 1) {
                        hcomp.push_str(&format!("a=c a&= {} hashd\n", v[1] - 1));
                    } else {
                        hcomp.push_str(&format!("a=c a%= {} hashd\n", v[1]));
                    }
                } else if (1000..=1255).contains(&v[1]) {
                    // Distance to the last occurrence of byte N2-1000.
                    hcomp.push_str(&format!(
                        "a= 255 a+= {} d=a a=*d a-=c a> 255 if a= 255 endif d= {ncomp} hashd\n",
                        v[1] - 1000
                    ));
                }
                let mut first_mask = true;
                for (iv, &x) in v.iter().enumerate().skip(2) {
                    if first_mask {
                        hcomp.push_str("b=c ");
                        first_mask = false;
                    }
                    if x == 255 {
                        hcomp.push_str("a=*b hashd\n");
                    } else if x > 0 && x < 255 {
                        hcomp.push_str(&format!("a=*b a&= {x} hashd\n"));
                    } else if (256..512).contains(&x) {
                        // LZ77 parse state or masked literal byte.
                        hcomp.push_str("a=r 1 a> 1 if\n  a=r 2 a< 64 if\n    a=*b ");
                        if x < 511 {
                            hcomp.push_str(&format!("a&= {}", x - 256));
                        }
                        hcomp.push_str(
                            " hashd\n  else\n    a>>= 6 hashd a=r 1 hashd\n  endif\n\
                             else\n  a= 255 hashd a=r 2 hashd\nendif\n",
                        );
                    } else if x >= 1256 {
                        hcomp.push_str(&format!(
                            "a= {} a<<= 8 a+= {} a+=b b=a\n",
                            ((x - 1000) >> 8) & 255,
                            (x - 1000) & 255
                        ));
                    } else if x > 1000 {
                        hcomp.push_str(&format!("a= {} a+=b b=a\n", x - 1000));
                    }
                    if x < 512 && iv < v.len() - 1 {
                        hcomp.push_str("b++ ");
                    }
                }
                ncomp += 1;
            }
            // m,t,s: mixers and SSE over earlier components.
            b'm' | b't' | b's' if ncomp > usize::from(cmd == b't') => {
                if v.is_empty() {
                    v.push(8);
                }
                if v.len() < 2 {
                    v.push(24 + 8 * i32::from(cmd == b's'));
                }
                if cmd == b's' && v.len() < 3 {
                    v.push(255);
                }
                comp.push_str(&format!("{ncomp}"));
                sb = 5 + v[0] * 3 / 4;
                match cmd {
                    b'm' => comp.push_str(&format!(" mix {} 0 {ncomp} {} 255\n", v[0], v[1])),
                    b't' => comp.push_str(&format!(
                        " mix2 {} {} {} {} 255\n",
                        v[0],
                        ncomp - 1,
                        ncomp - 2,
                        v[1]
                    )),
                    _ => comp.push_str(&format!(
                        " sse {} {} {} {}\n",
                        v[0],
                        ncomp - 1,
                        v[1],
                        v[2]
                    )),
                }
                if v[0] > 8 {
                    hcomp.push_str(&format!("d= {ncomp} *d=0 b=c a=0\n"));
                    let mut width = v[0];
                    while width >= 16 {
                        hcomp.push_str("a<<= 8 a+=*b");
                        if width > 16 {
                            hcomp.push_str(" b++");
                        }
                        hcomp.push('\n');
                        width -= 8;
                    }
                    if width > 8 {
                        hcomp.push_str(&format!("a<<= 8 a+=*b a>>= {}\n", 16 - width));
                    }
                    hcomp.push_str("a<<= 8 *d=a\n");
                }
                ncomp += 1;
            }
            // iN1,N2,...: ISSE chain with context order growing by each N.
            b'i' if ncomp > 0 => {
                hcomp.push_str(&format!("d= {} b=c a=*d d++\n", ncomp - 1));
                for (iv, &steps) in v.iter().enumerate() {
                    if ncomp >= 254 {
                        break;
                    }
                    for j in 0..steps {
                        hcomp.push_str("hash ");
                        if iv < v.len() - 1 || j < steps - 1 {
                            hcomp.push_str("b++ ");
                        }
                        sb += 6;
                    }
                    hcomp.push_str("*d=a");
                    if iv < v.len() - 1 {
                        hcomp.push_str(" d++");
                    }
                    hcomp.push('\n');
                    sb = sb.min(membits);
                    comp.push_str(&format!("{ncomp} isse {} {}\n", sb - 6, ncomp - 1));
                    ncomp += 1;
                }
            }
            // aN1,N2,N3: match model. N1 = hash multiplier, N2/N3 halve
            // the buffer and table.
            b'a' => {
                if v.is_empty() {
                    v.push(24);
                }
                while v.len() < 3 {
                    v.push(0);
                }
                comp.push_str(&format!(
                    "{ncomp} match {} {}\n",
                    membits - v[2] - 2,
                    membits - v[1]
                ));
                hcomp.push_str(&format!(
                    "d= {ncomp} a=*d a*= {} a+=*c a++ *d=a\n",
                    v[0]
                ));
                sb = 5 + (membits - v[1]) * 3 / 4;
                ncomp += 1;
            }
            // wN1,...,N5: ICM-ISSE chain over word contexts; a word is a
            // run of bytes whose masked value falls in [N2, N2+N3).
            b'w' => {
                let defaults = [1, 65, 26, 223, 20];
                for (iv, &d) in defaults.iter().enumerate() {
                    if v.len() <= iv {
                        v.push(d);
                    }
                }
                comp.push_str(&format!("{ncomp} icm {}\n", membits - 6));
                for i in 1..v[0] {
                    comp.push_str(&format!(
                        "{} isse {} {}\n",
                        ncomp + i as usize,
                        membits - 6,
                        ncomp + i as usize - 1
                    ));
                }
                hcomp.push_str(&format!(
                    "a=*c a&= {} a-= {} a&= 255 a< {} if\n",
                    v[3], v[1], v[2]
                ));
                for i in 0..v[0] {
                    if i == 0 {
                        hcomp.push_str(&format!("  d= {ncomp}"));
                    } else {
                        hcomp.push_str("  d++");
                    }
                    hcomp.push_str(&format!(" a=*d a*= {} a+=*c a++ *d=a\n", v[4]));
                }
                hcomp.push_str("else\n");
                for i in (1..v[0]).rev() {
                    hcomp.push_str(&format!(
                        "  d= {} a=*d d++ *d=a\n",
                        ncomp + i as usize - 1
                    ));
                }
                hcomp.push_str(&format!("  d= {ncomp} *d=0\nendif\n"));
                ncomp += v[0] as usize - 1;
                sb = membits;
                ncomp += 1;
            }
            b'm' | b't' | b's' | b'i' => {
                return Err(Error::Config(format!(
                    "component '{}' needs preceding components in method {method}",
                    cmd as char
                )));
            }
            _ => {
                return Err(Error::Config(format!(
                    "unknown component '{}' in method {method}",
                    cmd as char
                )));
            }
        }
    }

    let config = format!("{hdr}{ncomp}\n{comp}{hcomp}halt\n{pcomp}");
    Ok((config, args))
}

/// Post-processor for variable-length LZ77 codes, optionally with an
/// E8E9 pass at end of segment. State lives in R1 (parse state), R2
/// (length), R3 (offset bits expected), R4 (output pointer), R5 (low
/// offset bits); C holds the bit buffer and D its fill.
fn lz77_varlen_pcomp(rb: i32, doe8: bool) -> String {
    let mut p = String::from("pcomp lazy2 3 ;\n");
    p.push_str("a> 255 if\n");
    if doe8 {
        p.push_str(E8E9_OUTPUT_LOOP);
    }
    p.push_str(
        "a=0 b=0 c=0 d=0 r=a 1 r=a 2 r=a 3 r=a 4\nhalt\nendif\n\
         a<<=d a+=c c=a\na= 8 a+=d d=a\n\
         a=r 1 a== 0 if (match code mm,mmm)\n\
         \x20 a= 1 r=a 2\n\
         \x20 a=c a&= 3 a> 0 if\n\
         \x20   a-- a<<= 3 r=a 3\n\
         \x20   a=c a>>= 2 c=a\n\
         \x20   b=r 3 a&= 7 a+=b r=a 3\n\
         \x20   a=c a>>= 3 c=a\n\
         \x20   a=d a-= 5 d=a\n\
         \x20   a= 1 r=a 1\n\
         \x20 else (literal, discard 00)\n\
         \x20   a=c a>>= 2 c=a\n\
         \x20   d-- d--\n\
         \x20   a= 3 r=a 1\n\
         \x20 endif\n\
         endif\n\
         do a=r 1 a== 1 if a=d a> 2 if\n\
         \x20 a=c a&= 1 a== 1 if\n\
         \x20   a=c a>>= 1 c=a\n\
         \x20   b=r 2 a=c a&= 1 a+=b a+=b r=a 2\n\
         \x20   a=c a>>= 1 c=a\n\
         \x20   d-- d--\n\
         \x20 else\n\
         \x20   a=c a>>= 1 c=a\n\
         \x20   a=r 2 a<<= 2 b=a\n\
         \x20   a=c a&= 3 a+=b r=a 2\n\
         \x20   a=c a>>= 2 c=a\n\
         \x20   d-- d-- d--\n",
    );
    if rb > 0 {
        p.push_str("      a= 5 r=a 1\n");
    } else {
        p.push_str("      a= 2 r=a 1\n");
    }
    p.push_str("    endif\nforever endif endif\n");
    if rb > 0 {
        p.push_str(&format!(
            "a=r 1 a== 5 if a=d a> {} if\n\
             \x20 a=c a&= {} r=a 5\n\
             \x20 a=c a>>= {rb} c=a\n\
             \x20 a=d a-= {rb} d=a\n\
             \x20 a= 2 r=a 1\n\
             endif endif\n",
            rb - 1,
            (1 << rb) - 1
        ));
    }
    p.push_str(
        "a=r 1 a== 2 if a=r 3 a>d ifnot\n\
         \x20 a=c r=a 6 a=d r=a 7\n\
         \x20 b=r 3 a= 1 a<<=b d=a\n\
         \x20 a-- a&=c a+=d\n",
    );
    if rb > 0 {
        p.push_str(&format!(
            "  a<<= {rb} d=r 5 a+=d a-= {}\n",
            (1 << rb) - 1
        ));
    }
    p.push_str(
        "  d=a b=r 4 a=b a-=d c=a\n\
         \x20 d=r 2 do a=d a> 0 if d--\n\
         \x20   a=*c *b=a c++ b++",
    );
    if !doe8 {
        p.push_str(" out");
    }
    p.push_str(
        "\n\
         \x20 forever endif\n\
         \x20 a=b r=a 4\n\
         \x20 a=r 6 b=r 3 a>>=b c=a\n\
         \x20 a=r 7 a-=b d=a\n\
         \x20 a=0 r=a 1\n\
         endif endif\n\
         do a=r 1 a== 3 if a=d a> 1 if\n\
         \x20 a=c a&= 1 a== 1 if\n\
         \x20   a=c a>>= 1 c=a\n\
         \x20   b=r 2 a&= 1 a+=b a+=b r=a 2\n\
         \x20   a=c a>>= 1 c=a\n\
         \x20   d-- d--\n\
         \x20 else\n\
         \x20   a=c a>>= 1 c=a\n\
         \x20   d--\n\
         \x20   a= 4 r=a 1\n\
         \x20 endif\n\
         forever endif endif\n\
         a=r 1 a== 4 if a=d a> 7 if\n\
         \x20 b=r 4 a=c *b=a",
    );
    if !doe8 {
        p.push_str(" out");
    }
    p.push_str(
        "\n\
         \x20 b++ a=b r=a 4\n\
         \x20 a=c a>>= 8 c=a\n\
         \x20 a=d a-= 8 d=a\n\
         \x20 a=r 2 a-- r=a 2 a== 0 if\n\
         \x20   a=0 r=a 1\n\
         \x20 endif\n\
         endif endif\n\
         halt\nend\n",
    );
    p
}

/// Post-processor for byte-aligned LZ77. D is the parse state, M the
/// output buffer, B its size.
fn lz77_byte_pcomp(doe8: bool) -> String {
    let mut p = String::from("pcomp lzpre c ;\n");
    p.push_str("a> 255 if (end of segment)\n");
    if doe8 {
        p.push_str(E8E9_OUTPUT_LOOP);
    }
    p.push_str(
        "b=0 c=0 d=0 a=0 r=a 1 r=a 2\nhalt\nendif\n\
         c=a a=d a== 0 if\n\
         \x20 a=c a>>= 6 a++ d=a\n\
         \x20 a== 1 if (literal?)\n\
         \x20   a+=c r=a 1 a=0 r=a 2\n\
         \x20 else (3 to 5 byte match)\n\
         \x20   d++ a=c a&= 63 a+= $3 r=a 1 a=0 r=a 2\n\
         \x20 endif\n\
         else\n\
         \x20 a== 1 if (writing literal)\n\
         \x20   a=c *b=a b++",
    );
    if !doe8 {
        p.push_str(" out");
    }
    p.push_str(
        "\n\
         \x20   a=r 1 a-- a== 0 if d=0 endif r=a 1\n\
         \x20 else\n\
         \x20   a> 2 if (reading offset)\n\
         \x20     a=r 2 a<<= 8 a|=c r=a 2 d--\n\
         \x20   else (write match)\n\
         \x20     a=r 2 a<<= 8 a|=c c=a a=b a-=c a-- c=a\n\
         \x20     d=r 1\n\
         \x20     do\n\
         \x20       a=*c *b=a c++ b++",
    );
    if !doe8 {
        p.push_str(" out");
    }
    p.push_str(
        "\n\
         \x20     d-- a=d a> 0 while\n\
         \x20   endif\n\
         \x20 endif\n\
         endif\n\
         halt\nend\n",
    );
    p
}

/// Post-processor inverting the BWT (16 MiB list walk), optionally with
/// E8E9. The sentinel index arrives in the last four bytes; counts and
/// the successor list live in H.
fn bwt_pcomp(doe8: bool) -> String {
    let mut p = String::from("pcomp bwtrle c ;\n");
    p.push_str(
        "a> 255 ifnot\n\
         \x20 *b=a b++\n\
         elsel\n\
         \x20 (index in last 4 bytes, put in c and R1)\n\
         \x20 b-- a=*b\n\
         \x20 b-- a<<= 8 a+=*b\n\
         \x20 b-- a<<= 8 a+=*b\n\
         \x20 b-- a<<= 8 a+=*b c=a r=a 1\n\
         \x20 (save size in R2)\n\
         \x20 a=b r=a 2\n\
         \x20 (count bytes in H[~1..~255, ~0])\n\
         \x20 do\n\
         \x20   a=b a> 0 if\n\
         \x20     b-- a=*b a++ a&= 255 d=a d! *d++\n\
         \x20   forever\n\
         \x20 endif\n\
         \x20 (cumulative counts: H[~i=0..255] = count of bytes before i)\n\
         \x20 d=0 d! *d= 1 a=0\n\
         \x20 do\n\
         \x20   a+=*d *d=a d--\n\
         \x20 d<>a a! a> 255 a! d<>a until\n\
         \x20 (build first part of linked list in H[0..idx-1])\n\
         \x20 b=0 do\n\
         \x20   a=c a>b if\n\
         \x20     d=*b d! *d++ d=*d d-- *d=b\n\
         \x20   b++ forever\n\
         \x20 endif\n\
         \x20 (rest of list in H[idx+1..n-1])\n\
         \x20 b=c b++ c=r 2 do\n\
         \x20   a=c a>b if\n\
         \x20     d=*b d! *d++ d=*d d-- *d=b\n\
         \x20   b++ forever\n\
         \x20 endif\n\
         \x20 (copy M to low 8 bits of H to reduce cache misses)\n\
         \x20 b=0 do\n\
         \x20   a=c a>b if\n\
         \x20     d=b a=*d a<<= 8 a+=*b *d=a\n\
         \x20   b++ forever\n\
         \x20 endif\n\
         \x20 (traverse list and output)\n\
         \x20 d=r 1 b=0 do\n\
         \x20   a=d a== 0 ifnot\n\
         \x20     a=*d a>>= 8 d=a\n",
    );
    if doe8 {
        p.push_str("    *b=*d b++\n");
    } else {
        p.push_str("    a=*d out\n");
    }
    p.push_str("  forever\nendif\n");
    if doe8 {
        p.push_str(E8E9_OUTPUT_LOOP);
    }
    p.push_str("endif\nhalt\nend\n");
    p
}

/// ZPAQL fragment: apply the inverse E8E9 transform to `M[0..d-1]` and
/// emit it, used at end of segment by the LZ77 and BWT programs.
const E8E9_OUTPUT_LOOP: &str = "\
\x20 d=b b=0 do (for b=0..d-1)\n\
\x20   a=b a==d ifnot\n\
\x20     a+= 4 a<d if\n\
\x20       a=*b a&= 254 a== 232 if (e8 or e9?)\n\
\x20         c=b b++ b++ b++ b++ a=*b a++ a&= 254 a== 0 if (00 or ff)\n\
\x20           b-- a=*b\n\
\x20           b-- a<<= 8 a+=*b\n\
\x20           b-- a<<= 8 a+=*b\n\
\x20           a-=b a++\n\
\x20           *b=a a>>= 8 b++\n\
\x20           *b=a a>>= 8 b++\n\
\x20           *b=a b++\n\
\x20         endif\n\
\x20         b=c\n\
\x20       endif\n\
\x20     endif\n\
\x20     a=*b out b++\n\
\x20   forever\n\
\x20 endif\n";

/// Stand-alone E8E9 post-processor (no LZ77/BWT), streaming with a
/// five-byte lookahead kept in B.
const E8E9_PCOMP: &str = "\
pcomp e8e9 d ;\n\
a> 255 if\n\
\x20 a=c a> 4 if\n\
\x20   c= 4\n\
\x20 else\n\
\x20   a! a+= 5 a<<= 3 d=a a=b a>>=d b=a\n\
\x20 endif\n\
\x20 do a=c a> 0 if\n\
\x20   a=b out a>>= 8 b=a c--\n\
\x20 forever endif\n\
else\n\
\x20 *b=b a<<= 24 d=a a=b a>>= 8 a+=d b=a c++\n\
\x20 a=c a> 4 if\n\
\x20   a=*b out\n\
\x20   a&= 254 a== 232 if\n\
\x20     a=b a>>= 24 a++ a&= 254 a== 0 if\n\
\x20       a=b a>>= 24 a<<= 24 d=a\n\
\x20       a=b a-=c a+= 5\n\
\x20       a<<= 8 a>>= 8 a|=d b=a\n\
\x20     endif\n\
\x20   endif\n\
\x20 endif\n\
endif\n\
halt\nend\n";
