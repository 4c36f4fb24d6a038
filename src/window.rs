//! Sliding-window fragment buffer.
//!
//! One [`WindowBuffer`] handles one direction of the tunnel. The sending
//! side splits application data into numbered fragments, hands them out for
//! transmission with resend-on-timeout, and slides past fragments once they
//! are acknowledged. The receiving side coalesces duplicate and out-of-order
//! arrivals and reassembles contiguous fragment runs back into messages.
//!
//! # Protocol contract
//!
//! - Sequence IDs are assigned consecutively modulo 256; the first fragment
//!   of a message carries `start`, the last carries `end`.
//! - At most `windowsize` fragments are active at once; the backing ring is
//!   usually twice that so new data can queue behind the in-flight window.
//! - A fragment more than [`MAX_SEQ_AHEAD`] IDs ahead of the window start is
//!   treated as strictly behind (stale), never far-future.
//!
//! This module only manages state; all carrier I/O and scheduling is the
//! caller's responsibility. `now` is always caller-supplied, so nothing in
//! here reads the clock.

use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::seq::{wrap_index, SeqId, MAX_SEQ_AHEAD, MAX_SEQ_ID};

/// Largest fragment payload the downstream (receive) direction accepts.
pub const MAX_FRAGSIZE_DOWN: usize = 2048;

/// Largest fragment payload the upstream (send) direction accepts; bounded
/// by what fits in a DNS hostname.
pub const MAX_FRAGSIZE_UP: usize = 255;

/// Default resend deadline before a fragment becomes eligible again.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default cap on resends before a fragment is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Which role this window buffer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outgoing data: fragments are created locally and retired by ACKs.
    Sending,
    /// Incoming data: fragments arrive from the peer and are reassembled.
    Recving,
}

/// One fragment slot in the ring.
///
/// A slot with an empty payload is free. On the sending side `retries`
/// counts transmission attempts; on the receiving side it counts duplicate
/// arrivals of the same fragment.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    data: Vec<u8>,
    /// Sequence ID of this fragment.
    pub seq_id: SeqId,
    /// Send attempts (send side) or duplicate arrivals (recv side).
    pub retries: u32,
    /// Cumulative ACK count (send side only).
    pub acks: u32,
    /// Piggybacked opposite-direction ACK, if any.
    pub ack_other: Option<SeqId>,
    /// Payload is compressed.
    pub compressed: bool,
    /// First fragment of a message.
    pub start: bool,
    /// Last fragment of a message.
    pub end: bool,
    /// Most recent send attempt; `None` means never sent.
    pub last_sent: Option<Instant>,
}

impl Fragment {
    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length; 0 means the slot is free.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when this slot holds no fragment.
    pub fn is_free(&self) -> bool {
        self.data.is_empty()
    }

    fn reset(&mut self) {
        self.data.clear();
        self.seq_id = SeqId(0);
        self.retries = 0;
        self.acks = 0;
        self.ack_other = None;
        self.compressed = false;
        self.start = false;
        self.end = false;
        self.last_sent = None;
    }
}

/// Borrowed view of a fragment arriving off the wire.
#[derive(Debug, Clone, Copy)]
pub struct IncomingFragment<'a> {
    pub seq_id: SeqId,
    pub data: &'a [u8],
    pub compressed: bool,
    pub start: bool,
    pub end: bool,
}

/// Result of a successful reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reassembled {
    /// Bytes written to the caller's buffer.
    pub len: usize,
    /// The message was sent compressed.
    pub compressed: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window buffer full: {needed} slots needed, {free} free")]
    Full { needed: usize, free: usize },

    #[error("fragment of {len} bytes exceeds maximum fragment size {max}")]
    Oversize { len: usize, max: usize },

    #[error(
        "invalid window geometry: length {length}, windowsize {windowsize}, maxfraglen {maxfraglen}"
    )]
    Geometry {
        length: usize,
        windowsize: usize,
        maxfraglen: usize,
    },
}

/// Ring of fragment slots shared by both directions.
///
/// # Index layout (sending side)
///
/// ```text
///  window_start             last_write
///      │                        │
///  ────┼────────────────────────┼──────────▶ ring slots
///      │ ◀── in flight/queued ──│ ◀─ free ─
/// ```
///
/// The slot of a fragment with sequence ID `s` is always
/// `chunk_start + (s - start_seq_id)` wrapped to the ring length.
#[derive(Debug)]
pub struct WindowBuffer {
    frags: Vec<Fragment>,
    window_start: usize,
    chunk_start: usize,
    last_write: usize,
    cur_seq_id: SeqId,
    start_seq_id: SeqId,
    windowsize: usize,
    maxfraglen: usize,
    timeout: Duration,
    max_retries: u32,
    numitems: usize,
    resends: u32,
    oos: u32,
    direction: Direction,
}

impl WindowBuffer {
    /// Create a window of `length` slots with `windowsize` of them active
    /// at a time and fragments of at most `maxfraglen` bytes.
    ///
    /// `length` must not exceed [`MAX_SEQ_AHEAD`], which keeps every stored
    /// fragment within half the sequence space of the window start.
    pub fn new(
        length: usize,
        windowsize: usize,
        maxfraglen: usize,
        direction: Direction,
    ) -> Result<Self, WindowError> {
        Self::check_geometry(length, windowsize, maxfraglen, direction)?;
        Ok(Self {
            frags: vec![Fragment::default(); length],
            window_start: 0,
            chunk_start: 0,
            last_write: length - 1,
            cur_seq_id: SeqId(0),
            start_seq_id: SeqId(0),
            windowsize,
            maxfraglen,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            numitems: 0,
            resends: 0,
            oos: 0,
            direction,
        })
    }

    fn check_geometry(
        length: usize,
        windowsize: usize,
        maxfraglen: usize,
        direction: Direction,
    ) -> Result<(), WindowError> {
        let cap = match direction {
            Direction::Sending => MAX_FRAGSIZE_UP,
            Direction::Recving => MAX_FRAGSIZE_DOWN,
        };
        if windowsize == 0
            || length < windowsize
            || length > MAX_SEQ_AHEAD
            || maxfraglen == 0
            || maxfraglen > cap
        {
            return Err(WindowError::Geometry {
                length,
                windowsize,
                maxfraglen,
            });
        }
        Ok(())
    }

    /// Reallocate the ring for a new length and fragment size. Destroys all
    /// buffered fragments and resets counters.
    pub fn resize(&mut self, length: usize, maxfraglen: usize) -> Result<(), WindowError> {
        Self::check_geometry(length, self.windowsize, maxfraglen, self.direction)?;
        self.frags = vec![Fragment::default(); length];
        self.maxfraglen = maxfraglen;
        self.clear();
        Ok(())
    }

    /// Drop all fragments and reset indices and counters. Geometry, timeout
    /// and retry cap are preserved.
    pub fn clear(&mut self) {
        for f in &mut self.frags {
            f.reset();
        }
        self.window_start = 0;
        self.chunk_start = 0;
        self.last_write = self.frags.len() - 1;
        self.cur_seq_id = SeqId(0);
        self.start_seq_id = SeqId(0);
        self.numitems = 0;
        self.resends = 0;
        self.oos = 0;
    }

    /// Number of free fragment slots (slots, not bytes).
    pub fn available(&self) -> usize {
        self.frags.len() - self.numitems
    }

    /// Ring length in slots.
    pub fn length(&self) -> usize {
        self.frags.len()
    }

    /// Maximum fragments active at once.
    pub fn windowsize(&self) -> usize {
        self.windowsize
    }

    /// Maximum fragment payload size.
    pub fn maxfraglen(&self) -> usize {
        self.maxfraglen
    }

    /// Populated slots in the ring.
    pub fn numitems(&self) -> usize {
        self.numitems
    }

    /// Fragments resent (send side) or duplicates received (recv side).
    pub fn resends(&self) -> u32 {
        self.resends
    }

    /// Out-of-sequence fragments dropped.
    pub fn oos(&self) -> u32 {
        self.oos
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Next sequence ID to assign (send) or one past the newest seen (recv).
    pub fn cur_seq_id(&self) -> SeqId {
        self.cur_seq_id
    }

    /// Sequence ID stored at the oldest slot.
    pub fn start_seq_id(&self) -> SeqId {
        self.start_seq_id
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    #[inline]
    fn wrap(&self, idx: usize) -> usize {
        wrap_index(idx, self.frags.len())
    }

    /// Advance the window by `n` slots. With `delete`, every slot passed
    /// over is freed; otherwise contents are left untouched.
    pub fn slide(&mut self, n: usize, delete: bool) {
        if delete {
            for off in 0..n.min(self.frags.len()) {
                let idx = self.wrap(self.window_start + off);
                if !self.frags[idx].is_free() {
                    self.frags[idx].reset();
                    self.numitems -= 1;
                }
            }
        }
        self.window_start = self.wrap(self.window_start + n);
        self.start_seq_id = self.start_seq_id.advance(n);
        self.chunk_start = self.window_start;
        trace!(
            "slide {}: window_start={} start_seq_id={}",
            n,
            self.window_start,
            self.start_seq_id
        );
    }

    /// Post-processing hook, to be called after any state-changing call.
    ///
    /// On the sending side this retires the contiguous prefix of
    /// acknowledged (or dropped) fragments at the window start. On the
    /// receiving side reassembly drives sliding, so this is a no-op.
    pub fn tick(&mut self) {
        if self.direction != Direction::Sending {
            return;
        }
        let mut guard = self.frags.len();
        while guard > 0 {
            guard -= 1;
            let next_append = self.wrap(self.last_write + 1);
            if self.window_start == next_append && self.numitems == 0 {
                break;
            }
            let idx = self.window_start;
            if self.frags[idx].is_free() {
                // dropped fragment left a hole at the front
                self.slide(1, false);
                continue;
            }
            if self.frags[idx].acks > 0 {
                trace!("retiring acked fragment {}", self.frags[idx].seq_id);
                self.frags[idx].reset();
                self.numitems -= 1;
                self.slide(1, false);
                continue;
            }
            break;
        }
    }

    // ----- sending path -----

    /// Split `data` into fragments and queue them after the most recently
    /// written slot. Admission is atomic: if the fragments do not all fit,
    /// nothing is queued.
    ///
    /// Returns the number of fragments queued.
    pub fn add_outgoing_data(&mut self, data: &[u8], compressed: bool) -> Result<usize, WindowError> {
        debug_assert_eq!(self.direction, Direction::Sending);
        if data.is_empty() {
            return Ok(0);
        }
        let nfrags = data.len().div_ceil(self.maxfraglen);
        let free = self.available();
        if nfrags > free {
            return Err(WindowError::Full {
                needed: nfrags,
                free,
            });
        }
        for i in 1..=nfrags {
            if !self.frags[self.wrap(self.last_write + i)].is_free() {
                return Err(WindowError::Full {
                    needed: nfrags,
                    free,
                });
            }
        }

        for (i, chunk) in data.chunks(self.maxfraglen).enumerate() {
            let idx = self.wrap(self.last_write + 1);
            let seq = self.cur_seq_id;
            let f = &mut self.frags[idx];
            f.data.clear();
            f.data.extend_from_slice(chunk);
            f.seq_id = seq;
            f.retries = 0;
            f.acks = 0;
            f.ack_other = None;
            f.last_sent = None;
            f.compressed = compressed;
            f.start = i == 0;
            f.end = i == nfrags - 1;
            self.last_write = idx;
            self.cur_seq_id = seq.next();
            self.numitems += 1;
        }
        debug!(
            "queued {} bytes as {} fragments, seq {}..{}",
            data.len(),
            nfrags,
            self.cur_seq_id.advance(MAX_SEQ_ID - nfrags),
            self.cur_seq_id
        );
        Ok(nfrags)
    }

    fn due(&self, f: &Fragment, now: Instant) -> bool {
        !f.is_free()
            && f.acks == 0
            && match f.last_sent {
                None => true,
                Some(sent) => now.saturating_duration_since(sent) >= self.timeout,
            }
    }

    /// Number of fragments eligible to send at `now`: never sent, or past
    /// the resend deadline without an ACK.
    pub fn sending(&self, now: Instant) -> usize {
        let mut count = 0;
        for off in 0..self.windowsize {
            if self.due(&self.frags[self.wrap(self.window_start + off)], now) {
                count += 1;
            }
        }
        count
    }

    /// Return the next fragment due for (re)transmission, oldest first,
    /// stamping its send time and attempt count.
    ///
    /// `other_ack` is taken and attached to the returned fragment so the
    /// caller can piggyback a reverse-direction ACK. A due fragment that
    /// already exhausted its retries is freed and the scan continues.
    pub fn get_next_sending_fragment(
        &mut self,
        now: Instant,
        other_ack: &mut Option<SeqId>,
    ) -> Option<&Fragment> {
        debug_assert_eq!(self.direction, Direction::Sending);
        for off in 0..self.windowsize {
            let idx = self.wrap(self.window_start + off);
            if !self.due(&self.frags[idx], now) {
                continue;
            }
            if self.frags[idx].retries > self.max_retries {
                debug!(
                    "dropping fragment {} after {} attempts",
                    self.frags[idx].seq_id, self.frags[idx].retries
                );
                self.frags[idx].reset();
                self.numitems -= 1;
                continue;
            }
            if self.frags[idx].retries > 0 {
                self.resends += 1;
            }
            let f = &mut self.frags[idx];
            f.retries += 1;
            f.last_sent = Some(now);
            f.ack_other = other_ack.take();
            trace!("sending fragment {} attempt {}", f.seq_id, f.retries);
            return Some(&self.frags[idx]);
        }
        None
    }

    /// Record an ACK for `seqid`. ACKs outside the active window or for
    /// empty slots are late or duplicated and silently ignored.
    pub fn ack(&mut self, seqid: SeqId) {
        debug_assert_eq!(self.direction, Direction::Sending);
        let offset = seqid.offset_from(self.start_seq_id);
        if offset >= self.windowsize {
            trace!("ignoring ack {} outside window", seqid);
            return;
        }
        let idx = self.wrap(self.window_start + offset);
        let f = &mut self.frags[idx];
        if !f.is_free() && f.seq_id == seqid {
            f.acks += 1;
        }
    }

    // ----- receiving path -----

    /// Insert a fragment arriving from the peer at the slot its sequence ID
    /// maps to, coalescing duplicates and counting strays.
    ///
    /// Returns the number of payload bytes accepted; 0 for duplicates and
    /// drops.
    pub fn process_incoming_fragment(&mut self, f: &IncomingFragment<'_>) -> Result<usize, WindowError> {
        debug_assert_eq!(self.direction, Direction::Recving);
        if f.data.is_empty() {
            return Ok(0);
        }
        if f.data.len() > self.maxfraglen {
            return Err(WindowError::Oversize {
                len: f.data.len(),
                max: self.maxfraglen,
            });
        }

        let delta = f.seq_id.offset_from(self.start_seq_id);
        if delta >= MAX_SEQ_AHEAD {
            // strictly behind the window: at most a stale duplicate
            let back = MAX_SEQ_ID - delta;
            if back <= self.frags.len() {
                let idx = self.wrap(self.chunk_start + self.frags.len() - back);
                let dup = {
                    let slot = &self.frags[idx];
                    !slot.is_free() && slot.seq_id == f.seq_id
                };
                if dup {
                    self.frags[idx].retries += 1;
                    self.resends += 1;
                    debug!("stale duplicate fragment {} ({} behind window)", f.seq_id, back);
                    return Ok(0);
                }
            }
            self.oos += 1;
            debug!(
                "dropping stale fragment {} ({} behind window start {})",
                f.seq_id, back, self.start_seq_id
            );
            return Ok(0);
        }
        if delta >= self.windowsize {
            // too far ahead to admit without overrunning unacked slots
            self.oos += 1;
            debug!(
                "dropping fragment {} ({} ahead of window start {})",
                f.seq_id, delta, self.start_seq_id
            );
            return Ok(0);
        }

        let cur_off = self.cur_seq_id.offset_from(self.start_seq_id);
        let idx = self.wrap(self.chunk_start + delta);
        if self.frags[idx].is_free() {
            let slot = &mut self.frags[idx];
            slot.data.clear();
            slot.data.extend_from_slice(f.data);
            slot.seq_id = f.seq_id;
            slot.retries = 0;
            slot.acks = 0;
            slot.ack_other = None;
            slot.last_sent = None;
            slot.compressed = f.compressed;
            slot.start = f.start;
            slot.end = f.end;
            self.numitems += 1;
            if delta >= cur_off {
                self.cur_seq_id = f.seq_id.next();
            }
            trace!(
                "stored fragment {} ({} bytes) at slot {}",
                f.seq_id,
                f.data.len(),
                idx
            );
            Ok(f.data.len())
        } else if self.frags[idx].seq_id == f.seq_id {
            self.frags[idx].retries += 1;
            self.resends += 1;
            debug!("duplicate fragment {}", f.seq_id);
            Ok(0)
        } else {
            self.oos += 1;
            warn!(
                "sequence collision at slot {}: holds {}, got {}",
                idx, self.frags[idx].seq_id, f.seq_id
            );
            Ok(0)
        }
    }

    /// Reassemble the first complete message from the oldest fragments.
    ///
    /// Scans the contiguous populated run at the window start for a
    /// start-marked fragment followed, without a gap, by an end-marked one.
    /// On success the payloads are concatenated into `out` (truncated to
    /// its length), the consumed slots are freed, and the window slides past
    /// them. Leading fragments orphaned by a newer start marker are
    /// discarded in the same step. Nothing is mutated while the run is
    /// incomplete.
    pub fn reassemble(&mut self, out: &mut [u8]) -> Option<Reassembled> {
        debug_assert_eq!(self.direction, Direction::Recving);
        if self.numitems == 0 {
            return None;
        }

        let mut run_start = 0usize;
        let mut end_off = None;
        for off in 0..self.windowsize {
            let idx = self.wrap(self.chunk_start + off);
            let f = &self.frags[idx];
            if f.is_free() {
                break;
            }
            if f.start && off != run_start {
                // a fresh message begins here; everything before is orphaned
                run_start = off;
            }
            if f.end {
                let head = self.wrap(self.chunk_start + run_start);
                if self.frags[head].start {
                    end_off = Some(off);
                    break;
                }
                // end without a start can never complete; skip past it
                run_start = off + 1;
            }
        }
        let end_off = end_off?;

        let mut written = 0;
        let mut compressed = true;
        for off in run_start..=end_off {
            let idx = self.wrap(self.chunk_start + off);
            let f = &self.frags[idx];
            compressed &= f.compressed;
            let n = f.data.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&f.data[..n]);
            written += n;
            if n < f.data.len() {
                warn!(
                    "reassembly output truncated at {} bytes (fragment {})",
                    written, f.seq_id
                );
                break;
            }
        }

        if run_start > 0 {
            debug!("discarding {} orphaned leading fragments", run_start);
        }
        for off in 0..=end_off {
            let idx = self.wrap(self.chunk_start + off);
            if !self.frags[idx].is_free() {
                self.frags[idx].reset();
                self.numitems -= 1;
            }
        }
        self.slide(end_off + 1, false);
        debug!(
            "reassembled {} bytes from {} fragments",
            written,
            end_off - run_start + 1
        );
        Some(Reassembled {
            len: written,
            compressed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(length: usize, windowsize: usize, maxfraglen: usize) -> WindowBuffer {
        WindowBuffer::new(length, windowsize, maxfraglen, Direction::Sending).unwrap()
    }

    fn receiver(length: usize, windowsize: usize, maxfraglen: usize) -> WindowBuffer {
        WindowBuffer::new(length, windowsize, maxfraglen, Direction::Recving).unwrap()
    }

    fn incoming<'a>(f: &'a Fragment) -> IncomingFragment<'a> {
        IncomingFragment {
            seq_id: f.seq_id,
            data: f.data(),
            compressed: f.compressed,
            start: f.start,
            end: f.end,
        }
    }

    #[test]
    fn geometry_is_validated() {
        assert!(WindowBuffer::new(0, 0, 10, Direction::Sending).is_err());
        assert!(WindowBuffer::new(4, 8, 10, Direction::Sending).is_err());
        assert!(WindowBuffer::new(256, 8, 10, Direction::Sending).is_err());
        assert!(WindowBuffer::new(16, 8, 300, Direction::Sending).is_err());
        assert!(WindowBuffer::new(16, 8, 300, Direction::Recving).is_ok());
    }

    #[test]
    fn single_fragment_ideal_path() {
        let mut w = sender(16, 8, 8);
        let n = w.add_outgoing_data(b"hello", false).unwrap();
        assert_eq!(n, 1);
        assert_eq!(w.numitems(), 1);

        let now = Instant::now();
        assert_eq!(w.sending(now), 1);
        let mut other_ack = None;
        let f = w.get_next_sending_fragment(now, &mut other_ack).unwrap();
        assert_eq!(f.seq_id, SeqId(0));
        assert!(f.start && f.end);
        assert_eq!(f.data(), b"hello");
        assert_eq!(f.retries, 1);

        w.ack(SeqId(0));
        w.tick();
        assert_eq!(w.numitems(), 0);
        assert_eq!(w.start_seq_id(), SeqId(1));
    }

    #[test]
    fn fragments_are_split_and_flagged() {
        let mut w = sender(16, 8, 7);
        let data: Vec<u8> = (0..20).collect();
        assert_eq!(w.add_outgoing_data(&data, false).unwrap(), 3);

        let now = Instant::now();
        let mut none = None;
        let lens: Vec<(SeqId, usize, bool, bool)> = (0..3)
            .map(|_| {
                let f = w.get_next_sending_fragment(now, &mut none).unwrap();
                (f.seq_id, f.len(), f.start, f.end)
            })
            .collect();
        assert_eq!(
            lens,
            vec![
                (SeqId(0), 7, true, false),
                (SeqId(1), 7, false, false),
                (SeqId(2), 6, false, true),
            ]
        );
    }

    #[test]
    fn admission_is_atomic() {
        let mut w = sender(4, 4, 4);
        w.add_outgoing_data(&[1; 12], false).unwrap();
        assert_eq!(w.available(), 1);
        let err = w.add_outgoing_data(&[2; 8], false).unwrap_err();
        assert_eq!(err, WindowError::Full { needed: 2, free: 1 });
        // nothing changed
        assert_eq!(w.numitems(), 3);
        assert_eq!(w.cur_seq_id(), SeqId(3));
    }

    #[test]
    fn ack_is_idempotent() {
        let mut w = sender(16, 8, 8);
        w.add_outgoing_data(b"ab", false).unwrap();
        w.add_outgoing_data(b"cd", false).unwrap();
        w.ack(SeqId(0));
        w.ack(SeqId(0));
        w.ack(SeqId(0));
        w.tick();
        assert_eq!(w.numitems(), 1);
        assert_eq!(w.start_seq_id(), SeqId(1));
    }

    #[test]
    fn late_ack_is_ignored() {
        let mut w = sender(16, 8, 8);
        w.add_outgoing_data(b"ab", false).unwrap();
        w.ack(SeqId(0));
        w.tick();
        // window has moved on; the duplicate ack maps outside it
        w.ack(SeqId(0));
        w.tick();
        assert_eq!(w.numitems(), 0);
        assert_eq!(w.start_seq_id(), SeqId(1));
    }

    #[test]
    fn retry_cap_frees_the_slot() {
        let mut w = sender(16, 8, 8);
        w.set_timeout(Duration::from_millis(100));
        w.set_max_retries(2);
        w.add_outgoing_data(b"x", false).unwrap();

        let t0 = Instant::now();
        let mut none = None;
        assert!(w.get_next_sending_fragment(t0, &mut none).is_some());
        let t1 = t0 + Duration::from_millis(110);
        assert!(w.get_next_sending_fragment(t1, &mut none).is_some());
        let t2 = t0 + Duration::from_millis(220);
        let f = w.get_next_sending_fragment(t2, &mut none).unwrap();
        assert_eq!(f.retries, 3);
        // fourth attempt exceeds the cap: slot is freed instead
        let t3 = t0 + Duration::from_millis(330);
        assert!(w.get_next_sending_fragment(t3, &mut none).is_none());
        assert_eq!(w.numitems(), 0);
    }

    #[test]
    fn resend_only_after_timeout() {
        let mut w = sender(16, 8, 8);
        w.set_timeout(Duration::from_millis(100));
        w.add_outgoing_data(b"x", false).unwrap();

        let t0 = Instant::now();
        let mut none = None;
        assert!(w.get_next_sending_fragment(t0, &mut none).is_some());
        assert_eq!(w.sending(t0 + Duration::from_millis(50)), 0);
        assert_eq!(w.sending(t0 + Duration::from_millis(100)), 1);
        assert_eq!(w.resends(), 0);
        assert!(w
            .get_next_sending_fragment(t0 + Duration::from_millis(100), &mut none)
            .is_some());
        assert_eq!(w.resends(), 1);
    }

    #[test]
    fn piggyback_ack_is_taken_once() {
        let mut w = sender(16, 8, 8);
        w.add_outgoing_data(b"ab", false).unwrap();
        w.add_outgoing_data(b"cd", false).unwrap();
        let now = Instant::now();
        let mut other = Some(SeqId(42));
        let f = w.get_next_sending_fragment(now, &mut other).unwrap();
        assert_eq!(f.ack_other, Some(SeqId(42)));
        assert!(other.is_none());
        let f = w.get_next_sending_fragment(now, &mut other).unwrap();
        assert_eq!(f.ack_other, None);
    }

    #[test]
    fn receiver_reorders_and_reassembles() {
        let mut snd = sender(16, 8, 7);
        let mut rcv = receiver(16, 8, 7);
        let data: Vec<u8> = (0..20).collect();
        snd.add_outgoing_data(&data, false).unwrap();

        let now = Instant::now();
        let mut none = None;
        let mut frags = Vec::new();
        while let Some(f) = snd.get_next_sending_fragment(now, &mut none) {
            frags.push(f.clone());
        }
        // deliver 2, 0, 1
        for i in [2usize, 0, 1] {
            rcv.process_incoming_fragment(&incoming(&frags[i])).unwrap();
        }
        let mut out = [0u8; 64];
        let r = rcv.reassemble(&mut out).unwrap();
        assert_eq!(r.len, 20);
        assert!(!r.compressed);
        assert_eq!(&out[..20], &data[..]);
        assert_eq!(rcv.numitems(), 0);
        assert_eq!(rcv.start_seq_id(), SeqId(3));
    }

    #[test]
    fn duplicates_are_counted_not_delivered() {
        let mut snd = sender(16, 8, 8);
        let mut rcv = receiver(16, 8, 8);
        snd.add_outgoing_data(&[7; 10], false).unwrap();

        let now = Instant::now();
        let mut none = None;
        let f0 = snd.get_next_sending_fragment(now, &mut none).unwrap().clone();
        let f1 = snd.get_next_sending_fragment(now, &mut none).unwrap().clone();

        assert_eq!(rcv.process_incoming_fragment(&incoming(&f0)).unwrap(), 8);
        assert_eq!(rcv.process_incoming_fragment(&incoming(&f0)).unwrap(), 0);
        assert_eq!(rcv.process_incoming_fragment(&incoming(&f1)).unwrap(), 2);
        assert_eq!(rcv.process_incoming_fragment(&incoming(&f0)).unwrap(), 0);
        assert_eq!(rcv.resends(), 2);
        assert_eq!(rcv.oos(), 0);

        let mut out = [0u8; 32];
        let r = rcv.reassemble(&mut out).unwrap();
        assert_eq!(r.len, 10);
        assert_eq!(&out[..10], &[7; 10]);
    }

    #[test]
    fn stale_fragment_is_dropped() {
        let mut rcv = receiver(16, 8, 8);
        let stale = IncomingFragment {
            seq_id: SeqId(200),
            data: b"old",
            compressed: false,
            start: true,
            end: true,
        };
        assert_eq!(rcv.process_incoming_fragment(&stale).unwrap(), 0);
        assert_eq!(rcv.oos(), 1);
    }

    #[test]
    fn far_ahead_fragment_is_rejected() {
        let mut rcv = receiver(16, 8, 8);
        let ahead = IncomingFragment {
            seq_id: SeqId(12),
            data: b"soon",
            compressed: false,
            start: true,
            end: true,
        };
        assert_eq!(rcv.process_incoming_fragment(&ahead).unwrap(), 0);
        assert_eq!(rcv.oos(), 1);
        assert_eq!(rcv.numitems(), 0);
    }

    #[test]
    fn oversize_fragment_is_an_error() {
        let mut rcv = receiver(16, 8, 8);
        let big = IncomingFragment {
            seq_id: SeqId(0),
            data: &[0; 9],
            compressed: false,
            start: true,
            end: true,
        };
        assert!(matches!(
            rcv.process_incoming_fragment(&big),
            Err(WindowError::Oversize { len: 9, max: 8 })
        ));
    }

    #[test]
    fn incomplete_run_mutates_nothing() {
        let mut rcv = receiver(16, 8, 8);
        let first = IncomingFragment {
            seq_id: SeqId(0),
            data: b"part",
            compressed: false,
            start: true,
            end: false,
        };
        rcv.process_incoming_fragment(&first).unwrap();
        let mut out = [0u8; 32];
        assert!(rcv.reassemble(&mut out).is_none());
        assert_eq!(rcv.numitems(), 1);
        assert_eq!(rcv.start_seq_id(), SeqId(0));
    }

    #[test]
    fn orphaned_leading_fragments_are_discarded() {
        let mut rcv = receiver(16, 8, 8);
        // tail of a message whose start was lost for good
        let orphan = IncomingFragment {
            seq_id: SeqId(0),
            data: b"tail",
            compressed: false,
            start: false,
            end: false,
        };
        let head = IncomingFragment {
            seq_id: SeqId(1),
            data: b"whole",
            compressed: true,
            start: true,
            end: true,
        };
        rcv.process_incoming_fragment(&orphan).unwrap();
        rcv.process_incoming_fragment(&head).unwrap();

        let mut out = [0u8; 32];
        let r = rcv.reassemble(&mut out).unwrap();
        assert_eq!(r.len, 5);
        assert!(r.compressed);
        assert_eq!(&out[..5], b"whole");
        assert_eq!(rcv.numitems(), 0);
        assert_eq!(rcv.start_seq_id(), SeqId(2));
    }

    #[test]
    fn clear_resets_state_but_not_geometry() {
        let mut w = sender(16, 8, 8);
        w.add_outgoing_data(&[1; 30], false).unwrap();
        w.clear();
        assert_eq!(w.numitems(), 0);
        assert_eq!(w.available(), 16);
        assert_eq!(w.cur_seq_id(), SeqId(0));
        assert_eq!(w.windowsize(), 8);
        // usable again from scratch
        assert_eq!(w.add_outgoing_data(b"hi", false).unwrap(), 1);
    }

    #[test]
    fn resize_is_data_destructive() {
        let mut w = sender(16, 8, 8);
        w.add_outgoing_data(&[1; 30], false).unwrap();
        w.resize(32, 16).unwrap();
        assert_eq!(w.numitems(), 0);
        assert_eq!(w.length(), 32);
        assert_eq!(w.maxfraglen(), 16);
    }

    #[test]
    fn seq_ids_wrap_across_the_ring() {
        let mut snd = sender(8, 4, 4);
        let mut rcv = receiver(8, 4, 4);
        let now = Instant::now();
        let mut none = None;
        // push enough single-fragment messages to wrap the 256-ID space
        for round in 0..300u32 {
            let payload = [round as u8; 3];
            snd.add_outgoing_data(&payload, false).unwrap();
            let f = snd.get_next_sending_fragment(now, &mut none).unwrap().clone();
            rcv.process_incoming_fragment(&incoming(&f)).unwrap();
            snd.ack(f.seq_id);
            snd.tick();
            let mut out = [0u8; 16];
            let r = rcv.reassemble(&mut out).unwrap();
            assert_eq!(r.len, 3);
            assert_eq!(&out[..3], &payload[..]);
        }
        assert_eq!(snd.numitems(), 0);
        assert_eq!(rcv.numitems(), 0);
    }
}
