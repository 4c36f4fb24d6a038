//! Burrow: reliable delivery for DNS tunnels
//!
//! A DNS carrier is lossy, reordering and tiny: queries fit a couple of
//! hundred payload bytes at best and answers not much more. Burrow supplies
//! the two layers that make a byte stream survive that: a sliding-window
//! fragmentation engine and an authenticated downstream framing codec.
//!
//! ## Architecture
//!
//! ```text
//! Application bytes
//!     ↓ add_outgoing_data          ↑ reassemble
//! ┌───────────────────────────────────────────────┐
//! │ WindowBuffer                                  │ ← this crate
//! │  fragment / retransmit / dedupe / reassemble  │
//! ├───────────────────────────────────────────────┤
//! │ downstream_encode / downstream_decode         │ ← this crate
//! │  length + flags + CMC + HMAC-MD5 framing      │
//! └───────────────────────────────────────────────┘
//!     ↓ queries                    ↑ answers
//! DNS carrier (owned by the host application)
//! ```
//!
//! The engine is single-threaded and never blocks: the host's carrier loop
//! polls [`WindowBuffer::sending`], transmits what
//! [`WindowBuffer::get_next_sending_fragment`] hands out, and feeds arrivals
//! into [`WindowBuffer::process_incoming_fragment`]. Timestamps are always
//! caller-supplied, so the host also owns time.
//!
//! ## Quick start
//!
//! ```rust
//! use burrow::{Direction, IncomingFragment, WindowBuffer};
//! use std::time::Instant;
//!
//! let mut snd = WindowBuffer::new(16, 8, 7, Direction::Sending)?;
//! let mut rcv = WindowBuffer::new(16, 8, 7, Direction::Recving)?;
//!
//! snd.add_outgoing_data(b"tunnel me through port 53", false)?;
//! let mut piggyback = None;
//! while let Some(frag) = snd
//!     .get_next_sending_fragment(Instant::now(), &mut piggyback)
//!     .map(|f| f.clone())
//! {
//!     // ... encode into a DNS query, transmit, peer ACKs ...
//!     rcv.process_incoming_fragment(&IncomingFragment {
//!         seq_id: frag.seq_id,
//!         data: frag.data(),
//!         compressed: frag.compressed,
//!         start: frag.start,
//!         end: frag.end,
//!     })?;
//!     snd.ack(frag.seq_id);
//!     snd.tick();
//! }
//!
//! let mut out = [0u8; 64];
//! let msg = rcv.reassemble(&mut out).unwrap();
//! assert_eq!(&out[..msg.len], b"tunnel me through port 53");
//! # Ok::<(), burrow::WindowError>(())
//! ```

pub mod config;
pub mod downstream;
pub mod encoder;
pub mod seq;
pub mod window;

// Re-export core types
pub use config::EngineConfig;
pub use downstream::{
    downstream_decode, downstream_encode, hmac_md5, AnswerError, DownstreamError, DH_ERROR,
    DH_HMAC32,
};
pub use encoder::{
    b32_5to8, b32_8to5, encoded_dns_length, encoder_for, max_raw_length_from_dns, Codec, Encoder,
    DNS_MAXLABEL,
};
pub use seq::{dist_forward, wrap_index, SeqId, MAX_SEQ_AHEAD, MAX_SEQ_ID};
pub use window::{
    Direction, Fragment, IncomingFragment, Reassembled, WindowBuffer, WindowError,
    MAX_FRAGSIZE_DOWN, MAX_FRAGSIZE_UP,
};
