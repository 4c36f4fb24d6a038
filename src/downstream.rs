//! Downstream envelope: the authenticated frame carried in a DNS answer.
//!
//! Wire layout after decoding (the HMAC input prepends a 4-byte length):
//!
//! ```text
//! ┌───────────┬─────────┬─────────┬──────────────┬──────────┐
//! │ length: 4 │ flags:1 │  cmc: 4 │ hmac: 4 / 12 │   data   │
//! └───────────┴─────────┴─────────┴──────────────┴──────────┘
//!               ▲ base32-encoded, travels in the clear as the
//!                 first byte of the envelope
//! ```
//!
//! Everything after the flags byte is run through the codec selected by the
//! low three flag bits. The HMAC-MD5 tag covers length, flags, CMC, a zeroed
//! HMAC field and the payload, binding the envelope to the session key and
//! its CMC position. Error answers are always base32 with the full 96-bit
//! tag; a 32-bit-HMAC error envelope is itself treated as an integrity
//! failure.

use hmac::{Hmac, Mac};
use log::debug;
use md5::Md5;
use rand::Rng;
use thiserror::Error;

use crate::encoder::{b32_5to8, b32_8to5, encoder_for, Codec};

/// Flag bit selecting the 32-bit (4-byte) HMAC truncation instead of the
/// default 96-bit (12-byte) one.
pub const DH_HMAC32: u8 = 1 << 3;

/// Flag bit marking an in-band error answer; the low three bits then carry
/// the error code instead of a codec tag.
pub const DH_ERROR: u8 = 1 << 4;

/// Offset of the HMAC field within the HMAC input buffer.
const HMAC_OFFSET: usize = 9;

/// In-band error codes a server answer can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerError {
    BadAuth,
    BadLen,
    BadLogin,
    BadOpts,
    Other(u8),
}

impl AnswerError {
    pub fn from_code(code: u8) -> AnswerError {
        match code & 0x7 {
            1 => AnswerError::BadAuth,
            2 => AnswerError::BadLen,
            3 => AnswerError::BadLogin,
            4 => AnswerError::BadOpts,
            c => AnswerError::Other(c),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            AnswerError::BadAuth => 1,
            AnswerError::BadLen => 2,
            AnswerError::BadLogin => 3,
            AnswerError::BadOpts => 4,
            AnswerError::Other(c) => c & 0x7,
        }
    }
}

impl std::fmt::Display for AnswerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerError::BadAuth => {
                write!(f, "bad authentication (session likely expired due to inactivity)")
            }
            AnswerError::BadLen => write!(f, "bad length (query likely truncated)"),
            AnswerError::BadLogin => write!(f, "bad login (is password correct?)"),
            AnswerError::BadOpts => {
                write!(f, "bad server options or server did not accept forwarding")
            }
            AnswerError::Other(c) => write!(f, "unknown server error {:#x}", c),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DownstreamError {
    #[error("downstream data too short")]
    TooShort,

    #[error("bad HMAC on downstream data")]
    BadHmac,

    #[error("server error answer: {0}")]
    Answer(AnswerError),

    #[error("output buffer too small ({needed} bytes needed)")]
    NoRoom { needed: usize },

    #[error("cannot encode with codec tag {0}")]
    BadCodec(u8),
}

/// HMAC-MD5 over `msg` with `key`, full 16-byte tag. Envelopes use the
/// first 4 or 12 bytes of it.
pub fn hmac_md5(key: &[u8], msg: &[u8]) -> [u8; 16] {
    let mut mac =
        Hmac::<Md5>::new_from_slice(key).expect("HMAC-MD5 accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Build a downstream envelope around `data` and write it to `out`.
///
/// The first output byte is the base32-encoded flags, readable in the
/// clear; the rest is `[flags | cmc | hmac | data]` run through the codec
/// the flags select. Without a `key` (pre-login) the HMAC field is filled
/// with random bytes. An error envelope (`DH_ERROR`) is forced to base32
/// with the 96-bit HMAC.
///
/// Returns the envelope length.
pub fn downstream_encode(
    out: &mut [u8],
    data: &[u8],
    key: Option<&[u8]>,
    flags: u8,
    cmc: u32,
) -> Result<usize, DownstreamError> {
    let mut flags = flags;
    let mut codec = Codec::from_flags(flags);
    if flags & DH_ERROR != 0 {
        // errors are always 96-bit HMAC, base32
        flags &= !DH_HMAC32;
        codec = Codec::Base32;
    }
    let hmaclen = if flags & DH_HMAC32 != 0 { 4 } else { 12 };
    if out.len() < 5 + hmaclen + data.len() {
        return Err(DownstreamError::NoRoom {
            needed: 5 + hmaclen + data.len(),
        });
    }
    let enc = encoder_for(codec).ok_or(DownstreamError::BadCodec(flags & 0x7))?;

    // HMAC input: length + flags + CMC + zeroed hmac field + data
    let len = 1 + 4 + hmaclen + data.len();
    let mut hmacbuf = vec![0u8; len + 4];
    hmacbuf[0..4].copy_from_slice(&(len as u32).to_be_bytes());
    let encoded_flags = b32_5to8(flags);
    hmacbuf[4] = encoded_flags;
    hmacbuf[5..9].copy_from_slice(&cmc.to_be_bytes());
    hmacbuf[HMAC_OFFSET + hmaclen..].copy_from_slice(data);

    let tag: [u8; 16] = match key {
        Some(k) => hmac_md5(k, &hmacbuf),
        None => {
            // pre-login answers carry random bytes in the HMAC field
            let mut t = [0u8; 16];
            rand::thread_rng().fill(&mut t[..]);
            t
        }
    };
    hmacbuf[HMAC_OFFSET..HMAC_OFFSET + hmaclen].copy_from_slice(&tag[..hmaclen]);

    let needed = 1 + enc.encoded_length(len - 1);
    if needed > out.len() {
        return Err(DownstreamError::NoRoom { needed });
    }
    out[0] = encoded_flags;
    let written = enc.encode(&mut out[1..], &hmacbuf[5..5 + len - 1]);
    Ok(written + 1)
}

/// Validate and strip a downstream envelope; the exact reverse of
/// [`downstream_encode`].
///
/// On success the payload lands in `out` and its length is returned. On
/// any failure up to `out.len()` raw envelope bytes are copied through to
/// `out` so the caller can log what the wire actually carried.
pub fn downstream_decode(
    out: &mut [u8],
    encdata: &[u8],
    key: Option<&[u8]>,
) -> Result<usize, DownstreamError> {
    match decode_inner(out, encdata, key) {
        Ok(n) => Ok(n),
        Err(e) => {
            let n = out.len().min(encdata.len());
            out[..n].copy_from_slice(&encdata[..n]);
            Err(e)
        }
    }
}

fn decode_inner(
    out: &mut [u8],
    encdata: &[u8],
    key: Option<&[u8]>,
) -> Result<usize, DownstreamError> {
    if encdata.len() < 2 {
        return Err(DownstreamError::TooShort);
    }
    let flags = b32_8to5(encdata[0]).ok_or(DownstreamError::TooShort)?;
    let hmaclen = if flags & DH_HMAC32 != 0 { 4 } else { 12 };

    let mut answer = None;
    let mut codec = Codec::from_flags(flags);
    if flags & DH_ERROR != 0 {
        debug!("server answered with error code {:#x}", flags & 0x7);
        if hmaclen == 4 {
            // errors always carry the 96-bit HMAC
            return Err(DownstreamError::BadHmac);
        }
        answer = Some(AnswerError::from_code(flags & 0x7));
        codec = Codec::Base32;
    }
    let enc = encoder_for(codec).ok_or(DownstreamError::TooShort)?;

    // decode into the tail of a scratch buffer shaped like the HMAC input
    let mut buf = vec![0u8; 5 + enc.raw_length(encdata.len() - 1) + 1];
    let len = {
        let (_, tail) = buf.split_at_mut(5);
        enc.decode(tail, &encdata[1..])
    };
    if len < 4 + hmaclen {
        return Err(DownstreamError::TooShort);
    }

    if let Some(k) = key {
        buf[0..4].copy_from_slice(&((len + 1) as u32).to_be_bytes());
        buf[4] = encdata[0];
        let mut pkt_hmac = [0u8; 12];
        pkt_hmac[..hmaclen].copy_from_slice(&buf[HMAC_OFFSET..HMAC_OFFSET + hmaclen]);
        buf[HMAC_OFFSET..HMAC_OFFSET + hmaclen].fill(0);
        let tag = hmac_md5(k, &buf[..len + 5]);
        if tag[..hmaclen] != pkt_hmac[..hmaclen] {
            debug!(
                "bad HMAC: pkt={} actual={}",
                hex::encode(&pkt_hmac[..hmaclen]),
                hex::encode(&tag[..hmaclen])
            );
            return Err(DownstreamError::BadHmac);
        }
    }

    if let Some(a) = answer {
        return Err(DownstreamError::Answer(a));
    }
    let payload = len - 4 - hmaclen;
    if out.len() < payload {
        return Err(DownstreamError::NoRoom { needed: payload });
    }
    out[..payload].copy_from_slice(&buf[HMAC_OFFSET + hmaclen..5 + len]);
    Ok(payload)
}
