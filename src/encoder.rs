//! Byte-alphabet encoders for the DNS carrier.
//!
//! Hostnames restrict both length and alphabet, so payloads travel through
//! one of five codecs negotiated per session: base32 (always safe), base64
//! and base64u (hostname-safe variants), base128 (uses high bytes many
//! resolvers pass through), and raw (identity, for carriers that allow
//! arbitrary bytes). The codec in use is carried in the low three bits of
//! the downstream flags byte.
//!
//! The two 6-bit codecs ride the `base64` crate with custom alphabets; the
//! 5-bit and 7-bit codecs share a small bit-packing core since no registry
//! engine speaks their alphabets.

use base64::alphabet;
use base64::engine::{self, general_purpose, Engine as _};

/// Maximum encoded bytes per DNS label.
pub const DNS_MAXLABEL: usize = 63;

/// Codec tags as they appear in the low three flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Codec {
    /// Unknown or not negotiated yet.
    Unset = 0,
    Base32 = 1,
    Base64 = 2,
    Base64u = 3,
    Base128 = 4,
    /// Identity; carrier permits arbitrary bytes.
    Raw = 5,
}

impl Codec {
    /// Extract the codec tag from a flags byte.
    pub fn from_flags(flags: u8) -> Codec {
        match flags & 0x7 {
            1 => Codec::Base32,
            2 => Codec::Base64,
            3 => Codec::Base64u,
            4 => Codec::Base128,
            5 => Codec::Raw,
            _ => Codec::Unset,
        }
    }

    /// Look up a codec by its user-facing name.
    pub fn from_name(name: &str) -> Codec {
        match name.to_ascii_lowercase().as_str() {
            "base32" => Codec::Base32,
            "base64" => Codec::Base64,
            "base64u" => Codec::Base64u,
            "base128" => Codec::Base128,
            "raw" => Codec::Raw,
            _ => Codec::Unset,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Unset => "unset",
            Codec::Base32 => "base32",
            Codec::Base64 => "base64",
            Codec::Base64u => "base64u",
            Codec::Base128 => "base128",
            Codec::Raw => "raw",
        }
    }
}

/// A byte-alphabet transformation.
///
/// `encode` packs as many input bytes as the output slice can hold and
/// returns the encoded length. `decode` is the inverse; it stops at the
/// first byte outside the alphabet (or when `out` is full) and returns the
/// decoded length. The length helpers convert between raw and encoded byte
/// counts without touching data.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, out: &mut [u8], data: &[u8]) -> usize;
    fn decode(&self, out: &mut [u8], data: &[u8]) -> usize;
    /// Raw bytes recoverable from `encoded` encoded bytes.
    fn raw_length(&self, encoded: usize) -> usize;
    /// Encoded bytes produced by `raw` raw bytes.
    fn encoded_length(&self, raw: usize) -> usize;
}

/// The codec's encoder, or `None` for [`Codec::Unset`].
pub fn encoder_for(codec: Codec) -> Option<&'static dyn Encoder> {
    match codec {
        Codec::Unset => None,
        Codec::Base32 => Some(&BASE32),
        Codec::Base64 => Some(&BASE64),
        Codec::Base64u => Some(&BASE64U),
        Codec::Base128 => Some(&BASE128),
        Codec::Raw => Some(&RAW),
    }
}

// ----- bit-packing core (5-bit and 7-bit codecs) -----

const INVALID: u8 = 0xff;

const fn rev_table(alphabet: &[u8], fold_case: bool) -> [u8; 256] {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < alphabet.len() {
        let c = alphabet[i];
        table[c as usize] = i as u8;
        if fold_case {
            if c.is_ascii_lowercase() {
                table[(c - 32) as usize] = i as u8;
            } else if c.is_ascii_uppercase() {
                table[(c + 32) as usize] = i as u8;
            }
        }
        i += 1;
    }
    table
}

fn encode_bits(out: &mut [u8], data: &[u8], bits: u32, alphabet: &[u8]) -> usize {
    let mask = (1u32 << bits) - 1;
    // largest raw prefix whose encoding fits `out`
    let mut take = data.len().min(out.len() * bits as usize / 8);
    while (take * 8).div_ceil(bits as usize) > out.len() {
        take -= 1;
    }
    let mut acc = 0u32;
    let mut nbits = 0;
    let mut written = 0;
    for &b in &data[..take] {
        acc = (acc << 8) | b as u32;
        nbits += 8;
        while nbits >= bits {
            nbits -= bits;
            out[written] = alphabet[((acc >> nbits) & mask) as usize];
            written += 1;
        }
    }
    if nbits > 0 {
        out[written] = alphabet[((acc << (bits - nbits)) & mask) as usize];
        written += 1;
    }
    written
}

fn decode_bits(out: &mut [u8], data: &[u8], bits: u32, rev: &[u8; 256]) -> usize {
    let mut acc = 0u32;
    let mut nbits = 0;
    let mut written = 0;
    for &c in data {
        let v = rev[c as usize];
        if v == INVALID {
            break;
        }
        acc = (acc << bits) | v as u32;
        nbits += bits;
        if nbits >= 8 {
            nbits -= 8;
            if written == out.len() {
                return written;
            }
            out[written] = ((acc >> nbits) & 0xff) as u8;
            written += 1;
        }
    }
    written
}

// ----- base32 -----

// Lowercase alphabet; decode folds case because resolvers randomize it.
const B32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";
const B32_REV: [u8; 256] = rev_table(B32_ALPHABET, true);

/// Map a 5-bit value to its base32 character. Used for the cleartext flags
/// byte of downstream envelopes.
#[inline]
pub fn b32_5to8(v: u8) -> u8 {
    B32_ALPHABET[(v & 0x1f) as usize]
}

/// Inverse of [`b32_5to8`]; `None` for bytes outside the alphabet.
#[inline]
pub fn b32_8to5(c: u8) -> Option<u8> {
    match B32_REV[c as usize] {
        INVALID => None,
        v => Some(v),
    }
}

struct Base32Encoder;

static BASE32: Base32Encoder = Base32Encoder;

impl Encoder for Base32Encoder {
    fn name(&self) -> &'static str {
        "base32"
    }

    fn encode(&self, out: &mut [u8], data: &[u8]) -> usize {
        encode_bits(out, data, 5, B32_ALPHABET)
    }

    fn decode(&self, out: &mut [u8], data: &[u8]) -> usize {
        decode_bits(out, data, 5, &B32_REV)
    }

    fn raw_length(&self, encoded: usize) -> usize {
        encoded * 5 / 8
    }

    fn encoded_length(&self, raw: usize) -> usize {
        (raw * 8).div_ceil(5)
    }
}

// ----- base64 / base64u -----

// Hostname-safe variants: '-' replaces '/', and base64u additionally swaps
// '+' for '_' to survive resolvers that eat '+'.
const B64_CHARS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+-";
const B64U_CHARS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

const B64_ALPHABET: alphabet::Alphabet = match alphabet::Alphabet::new(B64_CHARS) {
    Ok(a) => a,
    Err(_) => panic!("invalid base64 alphabet"),
};
const B64U_ALPHABET: alphabet::Alphabet = match alphabet::Alphabet::new(B64U_CHARS) {
    Ok(a) => a,
    Err(_) => panic!("invalid base64u alphabet"),
};

static B64_ENGINE: engine::GeneralPurpose =
    engine::GeneralPurpose::new(&B64_ALPHABET, general_purpose::NO_PAD);
static B64U_ENGINE: engine::GeneralPurpose =
    engine::GeneralPurpose::new(&B64U_ALPHABET, general_purpose::NO_PAD);

struct Base64Encoder {
    name: &'static str,
    engine: &'static engine::GeneralPurpose,
    rev: [u8; 256],
}

static BASE64: Base64Encoder = Base64Encoder {
    name: "base64",
    engine: &B64_ENGINE,
    rev: rev_table(B64_CHARS.as_bytes(), false),
};

static BASE64U: Base64Encoder = Base64Encoder {
    name: "base64u",
    engine: &B64U_ENGINE,
    rev: rev_table(B64U_CHARS.as_bytes(), false),
};

impl Encoder for Base64Encoder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn encode(&self, out: &mut [u8], data: &[u8]) -> usize {
        let mut take = data.len().min(out.len() * 3 / 4);
        while self.encoded_length(take) > out.len() {
            take -= 1;
        }
        let encoded = self.engine.encode(&data[..take]);
        out[..encoded.len()].copy_from_slice(encoded.as_bytes());
        encoded.len()
    }

    fn decode(&self, out: &mut [u8], data: &[u8]) -> usize {
        let valid = data
            .iter()
            .position(|&c| self.rev[c as usize] == INVALID)
            .unwrap_or(data.len());
        match self.engine.decode(&data[..valid]) {
            Ok(decoded) => {
                let n = decoded.len().min(out.len());
                out[..n].copy_from_slice(&decoded[..n]);
                n
            }
            Err(_) => 0,
        }
    }

    fn raw_length(&self, encoded: usize) -> usize {
        encoded * 3 / 4
    }

    fn encoded_length(&self, raw: usize) -> usize {
        (raw * 8).div_ceil(6)
    }
}

// ----- base128 -----

const fn b128_alphabet() -> [u8; 128] {
    let mut a = [0u8; 128];
    let mut i = 0;
    while i < 26 {
        a[i] = b'a' + i as u8;
        i += 1;
    }
    while i < 52 {
        a[i] = b'A' + (i - 26) as u8;
        i += 1;
    }
    while i < 62 {
        a[i] = b'0' + (i - 52) as u8;
        i += 1;
    }
    // high bytes 0xbc..=0xfd survive most resolvers unmangled
    while i < 128 {
        a[i] = 0xbc + (i - 62) as u8;
        i += 1;
    }
    a
}

const B128_ALPHABET: [u8; 128] = b128_alphabet();
const B128_REV: [u8; 256] = rev_table(&B128_ALPHABET, false);

struct Base128Encoder;

static BASE128: Base128Encoder = Base128Encoder;

impl Encoder for Base128Encoder {
    fn name(&self) -> &'static str {
        "base128"
    }

    fn encode(&self, out: &mut [u8], data: &[u8]) -> usize {
        encode_bits(out, data, 7, &B128_ALPHABET)
    }

    fn decode(&self, out: &mut [u8], data: &[u8]) -> usize {
        decode_bits(out, data, 7, &B128_REV)
    }

    fn raw_length(&self, encoded: usize) -> usize {
        encoded * 7 / 8
    }

    fn encoded_length(&self, raw: usize) -> usize {
        (raw * 8).div_ceil(7)
    }
}

// ----- raw -----

struct RawEncoder;

static RAW: RawEncoder = RawEncoder;

impl Encoder for RawEncoder {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, out: &mut [u8], data: &[u8]) -> usize {
        let n = data.len().min(out.len());
        out[..n].copy_from_slice(&data[..n]);
        n
    }

    fn decode(&self, out: &mut [u8], data: &[u8]) -> usize {
        let n = data.len().min(out.len());
        out[..n].copy_from_slice(&data[..n]);
        n
    }

    fn raw_length(&self, encoded: usize) -> usize {
        encoded
    }

    fn encoded_length(&self, raw: usize) -> usize {
        raw
    }
}

// ----- DNS hostname length math -----

/// Maximum raw bytes that fit a hostname of `hostname_len` bytes once the
/// topdomain, label dots and encoding expansion are accounted for.
pub fn max_raw_length_from_dns(
    hostname_len: usize,
    enc: Option<&dyn Encoder>,
    topdomain: &str,
) -> usize {
    // dot before the topdomain
    let budget = hostname_len.saturating_sub(1 + topdomain.len());
    // one dot per full label; a 64-byte block is 63 data bytes plus a dot
    let enc_len = budget - budget / (DNS_MAXLABEL + 1);
    match enc {
        Some(e) => e.raw_length(enc_len),
        None => enc_len,
    }
}

/// Hostname length needed to carry `raw_len` raw bytes: encoded data plus
/// inter-label dots, the topdomain and its separating dot.
pub fn encoded_dns_length(raw_len: usize, enc: Option<&dyn Encoder>, topdomain: &str) -> usize {
    let enc_len = match enc {
        Some(e) => e.encoded_length(raw_len),
        None => raw_len,
    };
    let dots_within = if enc_len == 0 {
        0
    } else {
        (enc_len - 1) / DNS_MAXLABEL
    };
    enc_len + dots_within + 1 + topdomain.len()
}
