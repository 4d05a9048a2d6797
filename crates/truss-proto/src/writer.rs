use std::{borrow::Cow, io};

use truss_utils::{safe_assert, safe_panic};

use crate::{Outcome, Transcript};

const DEFAULT_CAPACITY: usize = 2048;
/// Blocks of `STREAM_BATCH * capacity` bytes are pumped between yields
/// when draining a long stream.
const STREAM_BATCH: u64 = 8;

type ReinitFn = Box<dyn FnMut(&mut Writer) -> Outcome + Send>;
type ManageFn = Box<dyn FnMut(u32) -> Outcome + Send>;

/// Control operations executed in sequence with the emission frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManageOp {
    /// Stop mirroring emissions to the transcript for the frames that
    /// follow.
    ClearLogging,
    /// Resume mirroring (if a transcript is installed).
    ResetLogging,
    /// Delegated to the handler installed with
    /// [`Writer::on_manage`].
    Custom(u32),
}

enum WFrame {
    Char { c: u8, silent: bool },
    Atom { data: Cow<'static, [u8]>, silent: bool },
    /// Tail of a long atom: written through directly, short remainders
    /// ride the buffer. Already logged by the atom frame.
    Raw { data: Cow<'static, [u8]>, off: usize },
    Stream { src: Box<dyn io::Read + Send>, remaining: u64 },
    /// Block-copy loop of a long stream; runs with a drained buffer.
    StreamBlocks { src: Box<dyn io::Read + Send>, remaining: u64 },
    Flush,
    FlushAll,
    Return(Outcome),
    Reinit(ReinitFn),
    Manage(ManageOp),
}

/// Non-blocking, buffer-oriented response builder.
///
/// A stack of frames describes what to emit next; [`run`] pops frames as
/// they complete, stopping when the channel would block (`Wait`), the
/// writer should give other work a turn (`Yield`), or the response is
/// doomed (`Failure`). Bytes queued for transmission live in
/// `[rpos, wpos)` of an owned buffer that grows on demand.
///
/// Frames execute in push order. A reinit frame's own pushes run before
/// anything queued behind it.
///
/// [`run`]: Writer::run
pub struct Writer {
    buf: Vec<u8>,
    rpos: usize,
    wpos: usize,
    stack: Vec<WFrame>,
    mark: usize,
    log: Option<Box<dyn Transcript>>,
    dolog: bool,
    flush_threshold: usize,
    max_double_capacity: usize,
    on_manage: Option<ManageFn>,
}

impl Writer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_CAPACITY / 4)
    }

    /// `flush_threshold` is clamped to `capacity / 2`: a frame shorter
    /// than the threshold must always fit into a freshly flushed buffer.
    pub fn with_capacity(capacity: usize, flush_threshold: usize) -> Self {
        let capacity = capacity.max(16);
        Self {
            buf: vec![0; capacity],
            rpos: 0,
            wpos: 0,
            stack: Vec::new(),
            mark: 0,
            log: None,
            dolog: false,
            flush_threshold: flush_threshold.min(capacity / 2),
            max_double_capacity: 4096,
            on_manage: None,
        }
    }

    pub fn with_transcript(mut self, log: Box<dyn Transcript>) -> Self {
        self.dolog = true;
        self.log = Some(log);
        self
    }

    pub fn on_manage(mut self, f: impl FnMut(u32) -> Outcome + Send + 'static) -> Self {
        self.on_manage = Some(Box::new(f));
        self
    }

    /// Bytes queued for transmission.
    #[inline]
    pub fn pending(&self) -> usize {
        self.wpos - self.rpos
    }

    #[inline]
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.rpos..self.wpos]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Drops pending frames and bytes, re-arming logging. For reuse after
    /// a failed exchange.
    pub fn clear(&mut self) {
        self.stack.clear();
        self.rpos = 0;
        self.wpos = 0;
        self.mark = 0;
        self.dolog = self.log.is_some();
    }

    // --- frame scheduling ------------------------------------------------

    pub fn push_char(&mut self, c: u8) -> &mut Self {
        self.push_frame(WFrame::Char { c, silent: false });
        self
    }

    pub fn push_char_silent(&mut self, c: u8) -> &mut Self {
        self.push_frame(WFrame::Char { c, silent: true });
        self
    }

    pub fn push_atom(&mut self, data: impl Into<Cow<'static, [u8]>>) -> &mut Self {
        self.push_frame(WFrame::Atom { data: data.into(), silent: false });
        self
    }

    pub fn push_atom_silent(&mut self, data: impl Into<Cow<'static, [u8]>>) -> &mut Self {
        self.push_frame(WFrame::Atom { data: data.into(), silent: true });
        self
    }

    /// Drains `size` bytes of `src` into the output. Short streams ride
    /// the buffer; long ones alternate block reads with direct writes,
    /// yielding between blocks.
    pub fn push_stream(&mut self, src: Box<dyn io::Read + Send>, size: u64) -> &mut Self {
        self.push_frame(WFrame::Stream { src, remaining: size });
        self
    }

    /// Writes buffered bytes only once the flush threshold is reached.
    pub fn push_flush(&mut self) -> &mut Self {
        self.push_frame(WFrame::Flush);
        self
    }

    /// Writes every buffered byte.
    pub fn push_flush_all(&mut self) -> &mut Self {
        self.push_frame(WFrame::FlushAll);
        self
    }

    /// Pops and bubbles `v` out of [`run`](Writer::run).
    pub fn push_return(&mut self, v: Outcome) -> &mut Self {
        self.push_frame(WFrame::Return(v));
        self
    }

    /// Calls back into user code to produce the next frames; this is how
    /// protocol layers extend the writer without it knowing their types.
    /// The callback is re-invoked while it returns
    /// [`Outcome::Continue`]; frames it pushes run first.
    pub fn push_reinit(&mut self, f: impl FnMut(&mut Writer) -> Outcome + Send + 'static) -> &mut Self {
        self.push_frame(WFrame::Reinit(Box::new(f)));
        self
    }

    pub fn push_manage(&mut self, op: ManageOp) -> &mut Self {
        self.push_frame(WFrame::Manage(op));
        self
    }

    // --- immediate emission ----------------------------------------------

    /// Appends one char to the buffer right away, mirroring it to the
    /// transcript.
    pub fn emit_char(&mut self, c: u8) {
        if self.dolog
            && let Some(log) = &mut self.log
        {
            log.write_char(c);
        }
        self.emit_char_silent(c);
    }

    pub fn emit_char_silent(&mut self, c: u8) {
        self.ensure_space(1);
        self.buf[self.wpos] = c;
        self.wpos += 1;
    }

    /// Appends raw bytes right away, mirroring them to the transcript.
    pub fn emit_atom(&mut self, data: &[u8]) {
        if self.dolog
            && let Some(log) = &mut self.log
        {
            log.write_atom(data);
        }
        self.emit_atom_silent(data);
    }

    pub fn emit_atom_silent(&mut self, data: &[u8]) {
        self.ensure_space(data.len());
        self.buf[self.wpos..self.wpos + data.len()].copy_from_slice(data);
        self.wpos += data.len();
    }

    /// Appends `v` as ASCII decimal digits, without allocating.
    pub fn emit_decimal(&mut self, mut v: u32) {
        if v == 0 {
            self.emit_char(b'0');
            return;
        }
        let mut tmp = [0u8; 12];
        let mut pos = tmp.len();
        while v != 0 {
            pos -= 1;
            tmp[pos] = b'0' + (v % 10) as u8;
            v /= 10;
        }
        self.emit_atom(&tmp[pos..]);
    }

    // --- execution -------------------------------------------------------

    /// Runs frames until the stack empties (`Success`), the channel
    /// blocks (`Wait`), a frame yields, or one fails.
    pub fn run(&mut self, ch: &mut dyn io::Write) -> Outcome {
        loop {
            let Some(frame) = self.stack.pop() else {
                self.mark = 0;
                return Outcome::Success;
            };
            match self.step(frame, ch) {
                Outcome::Success | Outcome::Continue => {}
                out => {
                    self.mark = 0;
                    return out;
                }
            }
        }
    }

    fn step(&mut self, frame: WFrame, ch: &mut dyn io::Write) -> Outcome {
        match frame {
            WFrame::Char { c, silent } => {
                if silent {
                    self.emit_char_silent(c);
                } else {
                    self.emit_char(c);
                }
                self.flush_or_park(ch, false)
            }
            WFrame::Atom { data, silent } => {
                if !silent
                    && self.dolog
                    && let Some(log) = &mut self.log
                {
                    log.write_atom(&data);
                }
                if data.len() < self.flush_threshold {
                    // Short atoms always fit after a flush.
                    self.emit_atom_silent(&data);
                    self.flush_or_park(ch, false)
                } else {
                    // Fill whatever room is left, then flush everything and
                    // write the tail through directly.
                    let room = self.buf.len() - self.wpos;
                    let head = room.min(data.len());
                    self.buf[self.wpos..self.wpos + head].copy_from_slice(&data[..head]);
                    self.wpos += head;
                    // The continuation runs after the flush drains.
                    self.stack.push(WFrame::Raw { data, off: head });
                    self.stack.push(WFrame::FlushAll);
                    Outcome::Continue
                }
            }
            WFrame::Raw { data, mut off } => {
                if data.len() - off < self.flush_threshold {
                    // Trailing remainder rides the buffer.
                    self.emit_atom_silent(&data[off..]);
                    return Outcome::Success;
                }
                loop {
                    match ch.write(&data[off..]) {
                        Ok(0) => return self.doom("raw write returned zero"),
                        Ok(n) => {
                            off += n;
                            if data.len() - off < self.flush_threshold {
                                self.emit_atom_silent(&data[off..]);
                                return Outcome::Success;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.stack.push(WFrame::Raw { data, off });
                            return Outcome::Wait;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            tracing::debug!(err = ?e, "direct write failed");
                            return Outcome::Failure;
                        }
                    }
                }
            }
            WFrame::Stream { mut src, remaining } => {
                if remaining < self.flush_threshold as u64 {
                    let len = remaining as usize;
                    self.ensure_space(len);
                    if let Err(e) = read_full(&mut *src, &mut self.buf[self.wpos..self.wpos + len])
                    {
                        tracing::debug!(err = ?e, "stream source failed");
                        return Outcome::Failure;
                    }
                    self.wpos += len;
                    self.flush_or_park(ch, false)
                } else {
                    self.stack.push(WFrame::StreamBlocks { src, remaining });
                    self.stack.push(WFrame::FlushAll);
                    Outcome::Continue
                }
            }
            WFrame::StreamBlocks { mut src, mut remaining } => {
                // The preceding flush-all drained the buffer.
                safe_assert!(self.pending() == 0, "stream block loop with buffered bytes");
                self.rpos = 0;
                self.wpos = 0;
                let capacity = self.buf.len();
                let mut batch = remaining.min(STREAM_BATCH * capacity as u64);
                remaining -= batch;
                while batch > 0 {
                    let toread = batch.min(capacity as u64) as usize;
                    if let Err(e) = read_full(&mut *src, &mut self.buf[..toread]) {
                        tracing::debug!(err = ?e, "stream source failed");
                        return Outcome::Failure;
                    }
                    batch -= toread as u64;
                    if batch == 0 && remaining == 0 && toread < self.flush_threshold {
                        // Final short chunk rides the buffer.
                        self.wpos = toread;
                        return Outcome::Success;
                    }
                    let mut off = 0;
                    while off < toread {
                        match ch.write(&self.buf[off..toread]) {
                            Ok(0) => return self.doom("stream write returned zero"),
                            Ok(n) => off += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                // Keep the unwritten part buffered and resume
                                // with a flush.
                                self.rpos = off;
                                self.wpos = toread;
                                self.stack.push(WFrame::StreamBlocks {
                                    src,
                                    remaining: remaining + batch,
                                });
                                self.stack.push(WFrame::FlushAll);
                                return Outcome::Wait;
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => {
                                tracing::debug!(err = ?e, "stream write failed");
                                return Outcome::Failure;
                            }
                        }
                    }
                }
                if remaining > 0 {
                    self.stack.push(WFrame::StreamBlocks { src, remaining });
                    return Outcome::Yield;
                }
                Outcome::Success
            }
            WFrame::Flush => self.flush_or_park(ch, false),
            WFrame::FlushAll => self.flush_or_park(ch, true),
            WFrame::Return(v) => v,
            WFrame::Reinit(mut f) => {
                let mark = self.stack.len();
                self.mark = mark;
                let out = f(self);
                match out {
                    Outcome::Success => Outcome::Success,
                    Outcome::Continue | Outcome::Wait | Outcome::Yield => {
                        self.stack.insert(mark, WFrame::Reinit(f));
                        out
                    }
                    Outcome::Failure => Outcome::Failure,
                }
            }
            WFrame::Manage(op) => match op {
                ManageOp::ClearLogging => {
                    self.dolog = false;
                    Outcome::Success
                }
                ManageOp::ResetLogging => {
                    self.dolog = self.log.is_some();
                    Outcome::Success
                }
                ManageOp::Custom(code) => match &mut self.on_manage {
                    Some(f) => f(code),
                    None => {
                        safe_panic!("unhandled manage op {code}");
                        Outcome::Success
                    }
                },
            },
        }
    }

    /// Writes `[rpos, wpos)` when forced or past the threshold. On a
    /// partial write the remainder is parked behind a flush-all frame and
    /// the caller sees `Wait`; once drained the cursors reset to base.
    fn flush_or_park(&mut self, ch: &mut dyn io::Write, all: bool) -> Outcome {
        let towrite = self.pending();
        if towrite == 0 || (!all && towrite < self.flush_threshold) {
            return Outcome::Success;
        }
        loop {
            match ch.write(&self.buf[self.rpos..self.wpos]) {
                Ok(0) => return self.doom("flush write returned zero"),
                Ok(n) => {
                    self.rpos += n;
                    if self.rpos == self.wpos {
                        if self.dolog
                            && let Some(log) = &mut self.log
                        {
                            log.write_flush();
                        }
                        self.rpos = 0;
                        self.wpos = 0;
                        return Outcome::Success;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.stack.push(WFrame::FlushAll);
                    return Outcome::Wait;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(err = ?e, "flush failed");
                    return Outcome::Failure;
                }
            }
        }
    }

    fn doom(&mut self, what: &'static str) -> Outcome {
        tracing::debug!(what, "write channel closed");
        Outcome::Failure
    }

    /// Grows the buffer preserving `[rpos, wpos)` at base: doubles up to a
    /// cap, then rounds the requested length into 256-byte steps plus
    /// slack.
    fn resize(&mut self, need: usize) {
        let requested = need + self.wpos;
        let mut newcap = self.buf.len() << 1;
        if !(newcap > requested && newcap < self.max_double_capacity) {
            newcap = requested - (requested & 255) + 512;
        }
        let mut tmp = vec![0; newcap];
        let pending = self.pending();
        tmp[..pending].copy_from_slice(&self.buf[self.rpos..self.wpos]);
        self.buf = tmp;
        self.rpos = 0;
        self.wpos = pending;
    }

    #[inline]
    fn ensure_space(&mut self, need: usize) {
        if self.buf.len() - self.wpos < need {
            self.resize(need);
        }
    }

    /// Frames land at the current context mark: successive pushes layer so
    /// the first-pushed frame runs first, and a reinit frame's children
    /// run before anything queued behind it.
    #[inline]
    fn push_frame(&mut self, frame: WFrame) {
        self.stack.insert(self.mark, frame);
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

fn read_full(src: &mut dyn io::Read, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match src.read(buf) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
