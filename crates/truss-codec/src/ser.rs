use std::io;

use crate::{CodecError, Limits, TypeMap, Wire, cross};

/// Free space below which a stream frame refuses to run; a step that small
/// cannot amortise the read call.
pub const MIN_STREAM_BUFFER: usize = 16;

/// Outcome of one user call frame.
pub enum Step {
    Success,
    Continue,
    Wait,
    Failure(CodecError),
}

type CallFn<'a> = Box<dyn FnMut(&mut Serializer<'a>, &mut u64) -> Step + 'a>;

enum SerFrame<'a> {
    /// Staged header bytes: fixed-width integers and cross-encoded lengths.
    Header { buf: [u8; cross::MAX_LEN], len: u8, off: u8 },
    /// Borrowed payload bytes (string/blob contents).
    Bytes { data: &'a [u8], off: usize },
    /// Bytes built at schedule time (bit-packed bool vectors).
    Owned { data: Vec<u8>, off: usize },
    /// Length-delimited blob drained through the output window.
    Stream { name: &'static str, src: &'a mut (dyn io::Read + 'a), remaining: u64 },
    /// User callback; re-invoked with its stage counter until it succeeds.
    Call { name: &'static str, stage: u64, f: CallFn<'a> },
}

/// Restartable, buffer-oriented serializer.
///
/// Frames are scheduled with the `push*` family and drained by [`run`],
/// which fills the output window and stops when the window is full or the
/// frame stack is empty. The stack preserves resumption state exactly, so
/// output may be split at any byte boundary.
///
/// Scheduling order is emission order: `push(a).push(b)` emits `a` first.
/// A call frame's own pushes are emitted before the frames that were queued
/// behind it.
///
/// [`run`]: Serializer::run
pub struct Serializer<'a> {
    stack: Vec<SerFrame<'a>>,
    mark: usize,
    limits: Limits,
    err: Option<CodecError>,
}

impl<'a> Serializer<'a> {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self { stack: Vec::new(), mark: 0, limits, err: None }
    }

    /// All scheduled frames have been emitted.
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

    /// Schedules a value. Emission order follows call order.
    pub fn push<T: Wire + ?Sized>(&mut self, v: &'a T, _name: &'static str) -> &mut Self {
        v.store(self);
        self
    }

    /// Schedules a cross-encoded integer.
    pub fn push_cross(&mut self, v: u64, _name: &'static str) -> &mut Self {
        let mut buf = [0u8; cross::MAX_LEN];
        let len = cross::encode(v, &mut buf);
        self.push_frame(SerFrame::Header { buf, len: len as u8, off: 0 });
        self
    }

    /// Schedules a blob: `size` as a fixed `u64`, then `size` bytes drained
    /// from `src` through the output window.
    pub fn push_stream(
        &mut self,
        src: &'a mut (dyn io::Read + 'a),
        size: u64,
        name: &'static str,
    ) -> &mut Self {
        if size > self.limits.stream_max {
            self.fail(CodecError::StreamLimit { len: size, max: self.limits.stream_max });
            return self;
        }
        self.push_fixed(size, 8);
        self.push_frame(SerFrame::Stream { name, src, remaining: size });
        self
    }

    /// Schedules a user callback for multi-phase emission. The callback is
    /// re-invoked with its stage counter until it returns
    /// [`Step::Success`]; frames it pushes run before it is re-invoked.
    pub fn push_call(
        &mut self,
        name: &'static str,
        f: impl FnMut(&mut Serializer<'a>, &mut u64) -> Step + 'a,
    ) -> &mut Self {
        self.push_frame(SerFrame::Call { name, stage: 0, f: Box::new(f) });
        self
    }

    /// Schedules a polymorphic value: its registered `(protocol, kind)`
    /// pair, then its payload.
    pub fn push_ptr<B: ?Sized + 'static>(
        &mut self,
        map: &'a TypeMap<B>,
        v: &'a B,
        name: &'static str,
    ) -> &mut Self {
        let Some(entry) = map.entry_for_value(v) else {
            self.fail(CodecError::UnregisteredType { name });
            return self;
        };
        let (protocol, kind) = entry.wire_pair();
        self.push_frame(SerFrame::Header { buf: pair_buf(protocol, kind), len: 2, off: 0 });
        entry.store(v, self);
        self
    }

    /// Schedules a container of polymorphic values: a cross-encoded count,
    /// then each element as in [`push_ptr`].
    ///
    /// [`push_ptr`]: Serializer::push_ptr
    pub fn push_ptr_slice<B: ?Sized + 'static>(
        &mut self,
        map: &'a TypeMap<B>,
        items: &'a [Box<B>],
        name: &'static str,
    ) -> &mut Self {
        let len = items.len() as u64;
        if len > self.limits.container_max {
            self.fail(CodecError::ContainerLimit { len, max: self.limits.container_max });
            return self;
        }
        self.push_cross(len, name);
        for item in items {
            self.push_ptr(map, item, name);
        }
        self
    }

    /// Produces bytes into `out`. Returns the number written; the stack
    /// holds whatever did not fit. After a failure every call returns the
    /// same error and emits nothing.
    pub fn run(&mut self, out: &mut [u8]) -> Result<usize, CodecError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let mut w = 0;
        while let Some(frame) = self.stack.pop() {
            match frame {
                SerFrame::Header { buf, len, mut off } => {
                    let take = ((len - off) as usize).min(out.len() - w);
                    out[w..w + take].copy_from_slice(&buf[off as usize..off as usize + take]);
                    w += take;
                    off += take as u8;
                    if off < len {
                        self.stack.push(SerFrame::Header { buf, len, off });
                        break;
                    }
                }
                SerFrame::Bytes { data, mut off } => {
                    let take = (data.len() - off).min(out.len() - w);
                    out[w..w + take].copy_from_slice(&data[off..off + take]);
                    w += take;
                    off += take;
                    if off < data.len() {
                        self.stack.push(SerFrame::Bytes { data, off });
                        break;
                    }
                }
                SerFrame::Owned { data, mut off } => {
                    let take = (data.len() - off).min(out.len() - w);
                    out[w..w + take].copy_from_slice(&data[off..off + take]);
                    w += take;
                    off += take;
                    if off < data.len() {
                        self.stack.push(SerFrame::Owned { data, off });
                        break;
                    }
                }
                SerFrame::Stream { name, src, mut remaining } => {
                    if remaining > 0 && out.len() - w < MIN_STREAM_BUFFER {
                        self.stack.push(SerFrame::Stream { name, src, remaining });
                        break;
                    }
                    let mut failed = None;
                    while remaining > 0 {
                        let space = out.len() - w;
                        if space < MIN_STREAM_BUFFER {
                            break;
                        }
                        let want = (remaining.min(space as u64)) as usize;
                        match src.read(&mut out[w..w + want]) {
                            Ok(0) => {
                                failed =
                                    Some(CodecError::StreamIo { kind: io::ErrorKind::UnexpectedEof });
                                break;
                            }
                            Ok(n) => {
                                w += n;
                                remaining -= n as u64;
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => {
                                failed = Some(CodecError::StreamIo { kind: e.kind() });
                                break;
                            }
                        }
                    }
                    if let Some(err) = failed {
                        tracing::debug!(name, ?err, "stream frame failed");
                        self.fail(err.clone());
                        self.mark = 0;
                        return Err(err);
                    }
                    if remaining > 0 {
                        self.stack.push(SerFrame::Stream { name, src, remaining });
                        break;
                    }
                }
                SerFrame::Call { name, mut stage, mut f } => {
                    let mark = self.stack.len();
                    self.mark = mark;
                    let step = f(self, &mut stage);
                    if let Some(err) = &self.err {
                        // A push inside the callback tripped a limit.
                        let err = err.clone();
                        self.mark = 0;
                        return Err(err);
                    }
                    match step {
                        Step::Success => {}
                        Step::Continue => {
                            self.stack.insert(mark, SerFrame::Call { name, stage, f });
                        }
                        Step::Wait => {
                            self.stack.insert(mark, SerFrame::Call { name, stage, f });
                            break;
                        }
                        Step::Failure(err) => {
                            tracing::debug!(name, ?err, "call frame failed");
                            self.fail(err.clone());
                            self.mark = 0;
                            return Err(err);
                        }
                    }
                }
            }
            if w == out.len() && !self.stack.is_empty() {
                break;
            }
        }
        self.mark = 0;
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        Ok(w)
    }

    #[inline]
    pub(crate) fn push_fixed(&mut self, v: u64, width: usize) {
        let mut buf = [0u8; cross::MAX_LEN];
        buf[..8].copy_from_slice(&v.to_le_bytes());
        self.push_frame(SerFrame::Header { buf, len: width as u8, off: 0 });
    }

    #[inline]
    pub(crate) fn push_bytes(&mut self, data: &'a [u8]) {
        self.push_frame(SerFrame::Bytes { data, off: 0 });
    }

    #[inline]
    pub(crate) fn push_owned(&mut self, data: Vec<u8>) {
        self.push_frame(SerFrame::Owned { data, off: 0 });
    }

    pub(crate) fn fail(&mut self, err: CodecError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
        self.stack.clear();
    }

    /// Frames land at the current context mark: successive pushes layer so
    /// that the first-pushed frame is popped first, and a call frame's
    /// children run before anything queued behind it.
    #[inline]
    fn push_frame(&mut self, frame: SerFrame<'a>) {
        self.stack.insert(self.mark, frame);
    }
}

impl Default for Serializer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn pair_buf(protocol: u8, kind: u8) -> [u8; cross::MAX_LEN] {
    let mut buf = [0u8; cross::MAX_LEN];
    buf[0] = protocol;
    buf[1] = kind;
    buf
}
