use std::{any::Any, io};

use truss_utils::safe_panic;

use crate::{CodecError, Limits, Step, TypeMap, Wire, cross};

/// Typed scratch slots produced by decode frames and consumed by call
/// frames assembling composite values.
pub enum Scratch {
    U64(u64),
    Bytes(Vec<u8>),
    Any(Box<dyn Any>),
}

type CallFn<'a> = Box<dyn FnMut(&mut Deserializer<'a>, &mut u64) -> Step + 'a>;
type FinishFn = fn(u64) -> Scratch;

enum DesFrame<'a> {
    /// Collects `need` raw little-endian bytes, then finishes into scratch.
    Fixed { need: u8, have: u8, buf: [u8; 8], finish: FinishFn },
    /// Cross-encoded integer: reads the leading byte, then hands any tail
    /// off to a `Fixed` frame.
    CrossLead { finish: FinishFn },
    /// Collects `remaining` payload bytes into an owned vector.
    BytesVal { remaining: u64, data: Vec<u8>, finish: fn(Vec<u8>) -> Result<Scratch, CodecError> },
    /// Copies a length-delimited blob into a sink.
    StreamOut { name: &'static str, dst: &'a mut (dyn io::Write + 'a), remaining: u64 },
    /// User callback; re-invoked with its stage counter until it succeeds.
    Call { name: &'static str, stage: u64, f: CallFn<'a> },
}

/// Restartable, buffer-oriented deserializer.
///
/// Mirror of [`Serializer`](crate::Serializer): frames are scheduled with
/// the `push*` family, [`run`] consumes input windows of any size, and the
/// frame stack preserves resumption state across splits. Decoded values
/// accumulate on a scratch stack; [`take`] pops the most recently produced
/// one, so a sequence of roots is taken in reverse push order.
///
/// [`run`]: Deserializer::run
/// [`take`]: Deserializer::take
pub struct Deserializer<'a> {
    stack: Vec<DesFrame<'a>>,
    vals: Vec<Scratch>,
    mark: usize,
    limits: Limits,
    err: Option<CodecError>,
}

impl<'a> Deserializer<'a> {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self { stack: Vec::new(), vals: Vec::new(), mark: 0, limits, err: None }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.stack.is_empty() && self.err.is_none()
    }

    #[inline]
    pub fn error(&self) -> Option<&CodecError> {
        self.err.as_ref()
    }

    #[inline]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Schedules decoding one value of `T`; the result is later popped with
    /// [`take`].
    ///
    /// [`take`]: Deserializer::take
    pub fn push<T: Wire>(&mut self, _name: &'static str) -> &mut Self {
        T::load(self);
        self
    }

    /// Schedules a cross-encoded integer; the result is popped with
    /// [`take_u64`].
    ///
    /// [`take_u64`]: Deserializer::take_u64
    pub fn push_cross(&mut self, _name: &'static str) -> &mut Self {
        self.push_frame(DesFrame::CrossLead { finish: Scratch::U64 });
        self
    }

    /// Schedules a blob: a fixed `u64` size checked against the stream
    /// limit, then that many bytes copied into `dst`.
    pub fn push_stream(
        &mut self,
        dst: &'a mut (dyn io::Write + 'a),
        name: &'static str,
    ) -> &mut Self {
        let mut dst = Some(dst);
        self.push_frame(DesFrame::Fixed { need: 8, have: 0, buf: [0; 8], finish: Scratch::U64 });
        self.push_call(name, move |d, stage| match *stage {
            0 => {
                let size = match d.take_u64() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                if size > d.limits.stream_max {
                    return Step::Failure(CodecError::StreamLimit {
                        len: size,
                        max: d.limits.stream_max,
                    });
                }
                let dst = dst.take().expect("stream stage runs once");
                d.push_frame(DesFrame::StreamOut { name, dst, remaining: size });
                Step::Success
            }
            _ => unreachable!(),
        });
        self
    }

    /// Schedules a user callback for multi-phase decoding.
    pub fn push_call(
        &mut self,
        name: &'static str,
        f: impl FnMut(&mut Deserializer<'a>, &mut u64) -> Step + 'a,
    ) -> &mut Self {
        self.push_frame(DesFrame::Call { name, stage: 0, f: Box::new(f) });
        self
    }

    /// Schedules a polymorphic value: reads the `(protocol, kind)` pair,
    /// looks up the registered loader and leaves a `Box<B>` for
    /// [`take_ptr`].
    ///
    /// [`take_ptr`]: Deserializer::take_ptr
    pub fn push_ptr<B: ?Sized + 'static>(
        &mut self,
        map: &'a TypeMap<B>,
        name: &'static str,
    ) -> &mut Self {
        let mut entry_idx = 0;
        self.push_call(name, move |d, stage| match *stage {
            0 => {
                *stage = 1;
                d.push_frame(DesFrame::Fixed {
                    need: 2,
                    have: 0,
                    buf: [0; 8],
                    finish: Scratch::U64,
                });
                Step::Continue
            }
            1 => {
                let raw = match d.take_u64() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                let (protocol, kind) = (raw as u8, (raw >> 8) as u8);
                let Some((idx, entry)) = map.entry_for_wire(protocol, kind) else {
                    return Step::Failure(CodecError::UnknownType { protocol, kind });
                };
                entry_idx = idx;
                *stage = 2;
                entry.load(d);
                Step::Continue
            }
            2 => {
                let concrete = match d.pop_any() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                // Pair was validated in stage 1; a downcast miss here is a
                // registration bug.
                match map.finish(entry_idx, concrete) {
                    Some(boxed) => {
                        d.vals.push(Scratch::Any(Box::new(boxed)));
                        Step::Success
                    }
                    None => Step::Failure(CodecError::Scratch),
                }
            }
            _ => unreachable!(),
        });
        self
    }

    /// Schedules a container of polymorphic values; leaves a
    /// `Vec<Box<B>>` for [`take`].
    ///
    /// [`take`]: Deserializer::take
    pub fn push_ptr_vec<B: ?Sized + 'static>(
        &mut self,
        map: &'a TypeMap<B>,
        name: &'static str,
    ) -> &mut Self {
        let mut out: Vec<Box<B>> = Vec::new();
        let mut count = 0u64;
        self.push_cross(name);
        self.push_call(name, move |d, stage| match *stage {
            0 => {
                count = match d.take_u64() {
                    Ok(v) => v,
                    Err(e) => return Step::Failure(e),
                };
                if count > d.limits.container_max {
                    return Step::Failure(CodecError::ContainerLimit {
                        len: count,
                        max: d.limits.container_max,
                    });
                }
                *stage = 1;
                Step::Continue
            }
            1 => {
                if out.len() as u64 == count {
                    d.vals.push(Scratch::Any(Box::new(std::mem::take(&mut out))));
                    return Step::Success;
                }
                *stage = 2;
                d.push_ptr(map, name);
                Step::Continue
            }
            2 => {
                match d.take_ptr::<B>() {
                    Ok(v) => out.push(v),
                    Err(e) => return Step::Failure(e),
                }
                *stage = 1;
                Step::Continue
            }
            _ => unreachable!(),
        });
        self
    }

    /// Consumes bytes from `input`, returning how many were used. The
    /// stack resumes mid-frame on the next call. After a failure every
    /// call returns the same error.
    pub fn run(&mut self, input: &[u8]) -> Result<usize, CodecError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let mut r = 0;
        while let Some(frame) = self.stack.pop() {
            match frame {
                DesFrame::Fixed { need, mut have, mut buf, finish } => {
                    let take = ((need - have) as usize).min(input.len() - r);
                    buf[have as usize..have as usize + take]
                        .copy_from_slice(&input[r..r + take]);
                    r += take;
                    have += take as u8;
                    if have < need {
                        self.stack.push(DesFrame::Fixed { need, have, buf, finish });
                        break;
                    }
                    self.vals.push(finish(u64::from_le_bytes(buf)));
                }
                DesFrame::CrossLead { finish } => {
                    if input.len() == r {
                        self.stack.push(DesFrame::CrossLead { finish });
                        break;
                    }
                    let lead = input[r];
                    r += 1;
                    let tail = cross::tail_len(lead);
                    if tail == 0 {
                        self.vals.push(finish(u64::from(lead)));
                    } else {
                        self.stack.push(DesFrame::Fixed {
                            need: tail as u8,
                            have: 0,
                            buf: [0; 8],
                            finish,
                        });
                    }
                }
                DesFrame::BytesVal { mut remaining, mut data, finish } => {
                    let take = (remaining.min((input.len() - r) as u64)) as usize;
                    data.extend_from_slice(&input[r..r + take]);
                    r += take;
                    remaining -= take as u64;
                    if remaining > 0 {
                        self.stack.push(DesFrame::BytesVal { remaining, data, finish });
                        break;
                    }
                    match finish(data) {
                        Ok(v) => self.vals.push(v),
                        Err(err) => return self.give_up(err),
                    }
                }
                DesFrame::StreamOut { name, dst, mut remaining } => {
                    let mut blocked = false;
                    let mut failed = None;
                    while remaining > 0 {
                        let take = (remaining.min((input.len() - r) as u64)) as usize;
                        if take == 0 {
                            break;
                        }
                        match dst.write(&input[r..r + take]) {
                            Ok(0) => {
                                failed =
                                    Some(CodecError::StreamIo { kind: io::ErrorKind::WriteZero });
                                break;
                            }
                            Ok(n) => {
                                r += n;
                                remaining -= n as u64;
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                blocked = true;
                                break;
                            }
                            Err(e) => {
                                failed = Some(CodecError::StreamIo { kind: e.kind() });
                                break;
                            }
                        }
                    }
                    if let Some(err) = failed {
                        tracing::debug!(name, ?err, "stream sink failed");
                        return self.give_up(err);
                    }
                    if remaining > 0 {
                        self.stack.push(DesFrame::StreamOut { name, dst, remaining });
                        if blocked || r == input.len() {
                            break;
                        }
                    }
                }
                DesFrame::Call { name, mut stage, mut f } => {
                    let mark = self.stack.len();
                    self.mark = mark;
                    match f(self, &mut stage) {
                        Step::Success => {}
                        Step::Continue => {
                            self.stack.insert(mark, DesFrame::Call { name, stage, f });
                        }
                        Step::Wait => {
                            self.stack.insert(mark, DesFrame::Call { name, stage, f });
                            break;
                        }
                        Step::Failure(err) => {
                            tracing::debug!(name, ?err, "call frame failed");
                            return self.give_up(err);
                        }
                    }
                }
            }
            if r == input.len() && !self.stack.is_empty() && !self.only_calls_ready() {
                break;
            }
        }
        self.mark = 0;
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        Ok(r)
    }

    /// Pops the most recently decoded value.
    pub fn take<T: 'static>(&mut self) -> Result<T, CodecError> {
        match self.pop_any()?.downcast::<T>() {
            Ok(v) => Ok(*v),
            Err(_) => {
                safe_panic!("scratch type mismatch");
                Err(CodecError::Scratch)
            }
        }
    }

    /// Pops a polymorphic value decoded by
    /// [`push_ptr`](Deserializer::push_ptr).
    pub fn take_ptr<B: ?Sized + 'static>(&mut self) -> Result<Box<B>, CodecError> {
        self.take::<Box<B>>()
    }

    /// Pops an integer decoded by [`push_cross`](Deserializer::push_cross).
    pub fn take_u64(&mut self) -> Result<u64, CodecError> {
        match self.vals.pop() {
            Some(Scratch::U64(v)) => Ok(v),
            _ => {
                safe_panic!("scratch stack expected an integer");
                Err(CodecError::Scratch)
            }
        }
    }

    pub(crate) fn take_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        match self.vals.pop() {
            Some(Scratch::Bytes(v)) => Ok(v),
            _ => {
                safe_panic!("scratch stack expected bytes");
                Err(CodecError::Scratch)
            }
        }
    }

    fn pop_any(&mut self) -> Result<Box<dyn Any>, CodecError> {
        match self.vals.pop() {
            Some(Scratch::Any(v)) => Ok(v),
            _ => {
                safe_panic!("scratch stack expected a value");
                Err(CodecError::Scratch)
            }
        }
    }

    pub fn push_scratch(&mut self, v: Scratch) {
        self.vals.push(v);
    }

    pub(crate) fn push_prim(&mut self, width: usize, finish: FinishFn) {
        self.push_frame(DesFrame::Fixed { need: width as u8, have: 0, buf: [0; 8], finish });
    }

    pub(crate) fn push_len_bytes(
        &mut self,
        len: u64,
        finish: fn(Vec<u8>) -> Result<Scratch, CodecError>,
    ) {
        let data = Vec::with_capacity(len.min(4096) as usize);
        self.push_frame(DesFrame::BytesVal { remaining: len, data, finish });
    }

    fn give_up(&mut self, err: CodecError) -> Result<usize, CodecError> {
        self.mark = 0;
        if self.err.is_none() {
            self.err = Some(err.clone());
        }
        self.stack.clear();
        self.vals.clear();
        Err(err)
    }

    /// True while the top frame is a call frame: those can make progress
    /// (assembling already-decoded scratch) without any input left.
    fn only_calls_ready(&self) -> bool {
        matches!(self.stack.last(), Some(DesFrame::Call { .. }))
    }

    #[inline]
    fn push_frame(&mut self, frame: DesFrame<'a>) {
        self.stack.insert(self.mark, frame);
    }
}

impl Default for Deserializer<'_> {
    fn default() -> Self {
        Self::new()
    }
}
