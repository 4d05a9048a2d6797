use std::io;

use crate::Outcome;

const DEFAULT_CAPACITY: usize = 2048;

type ReinitFn = Box<dyn FnMut(&mut Reader) -> Outcome + Send>;

enum RFrame {
    ScanChar,
    ScanAtom { max: usize, started: bool },
    ScanQuoted { max: usize, state: QState },
    ScanLiteral { remaining: u64, started: bool },
    ScanCrlf { seen_cr: bool },
    Return(Outcome),
    Reinit(ReinitFn),
}

#[derive(Clone, Copy)]
enum QState {
    Open,
    Body,
    Escape,
}

enum Fill {
    Got,
    Wait,
    Closed,
}

/// Parser mirror of the [`Writer`](crate::Writer): a stack of scan frames
/// consumes buffered input, suspending with `Wait` whenever the channel
/// has no more bytes. Scanned results land in reader-owned scratch —
/// [`last_char`] and [`atom`] — which reinit continuations pick up to
/// assemble commands.
///
/// [`last_char`]: Reader::last_char
/// [`atom`]: Reader::atom
pub struct Reader {
    buf: Vec<u8>,
    rpos: usize,
    wpos: usize,
    stack: Vec<RFrame>,
    mark: usize,
    ch: u8,
    atom: Vec<u8>,
}

impl Reader {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(16)],
            rpos: 0,
            wpos: 0,
            stack: Vec::new(),
            mark: 0,
            ch: 0,
            atom: Vec::new(),
        }
    }

    /// Last char consumed by a `scan_char` frame.
    #[inline]
    pub fn last_char(&self) -> u8 {
        self.ch
    }

    /// Bytes collected by the last atom / quoted-string / literal frame.
    #[inline]
    pub fn atom(&self) -> &[u8] {
        &self.atom
    }

    pub fn take_atom(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.atom)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
        self.rpos = 0;
        self.wpos = 0;
        self.mark = 0;
        self.atom.clear();
    }

    // --- frame scheduling ------------------------------------------------

    /// Consumes one char into [`last_char`](Reader::last_char).
    pub fn push_scan_char(&mut self) -> &mut Self {
        self.push_frame(RFrame::ScanChar);
        self
    }

    /// Collects chars into the atom until a space or line break; the
    /// delimiter stays in the input. Longer than `max` fails.
    pub fn push_scan_atom(&mut self, max: usize) -> &mut Self {
        self.push_frame(RFrame::ScanAtom { max, started: false });
        self
    }

    /// Collects a `"`-delimited string with backslash escapes into the
    /// atom, consuming both quotes.
    pub fn push_scan_quoted(&mut self, max: usize) -> &mut Self {
        self.push_frame(RFrame::ScanQuoted { max, state: QState::Open });
        self
    }

    /// Collects exactly `n` raw bytes into the atom.
    pub fn push_scan_literal(&mut self, n: u64) -> &mut Self {
        self.push_frame(RFrame::ScanLiteral { remaining: n, started: false });
        self
    }

    /// Consumes a CRLF pair; anything else fails.
    pub fn push_scan_crlf(&mut self) -> &mut Self {
        self.push_frame(RFrame::ScanCrlf { seen_cr: false });
        self
    }

    /// Pops and bubbles `v` out of [`run`](Reader::run).
    pub fn push_return(&mut self, v: Outcome) -> &mut Self {
        self.push_frame(RFrame::Return(v));
        self
    }

    /// Calls back into user code to consume scratch results and schedule
    /// the next scans. Re-invoked while it returns
    /// [`Outcome::Continue`]; frames it pushes run first.
    pub fn push_reinit(&mut self, f: impl FnMut(&mut Reader) -> Outcome + Send + 'static) -> &mut Self {
        self.push_frame(RFrame::Reinit(Box::new(f)));
        self
    }

    // --- execution -------------------------------------------------------

    /// Runs frames until the stack empties, input runs dry (`Wait`), a
    /// frame yields, or the exchange is malformed (`Failure`).
    pub fn run(&mut self, ch: &mut dyn io::Read) -> Outcome {
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

    fn step(&mut self, frame: RFrame, ch: &mut dyn io::Read) -> Outcome {
        match frame {
            RFrame::ScanChar => loop {
                if self.rpos < self.wpos {
                    self.ch = self.buf[self.rpos];
                    self.rpos += 1;
                    return Outcome::Success;
                }
                match self.fill(ch) {
                    Fill::Got => {}
                    Fill::Wait => {
                        self.stack.push(RFrame::ScanChar);
                        return Outcome::Wait;
                    }
                    Fill::Closed => return Outcome::Failure,
                }
            },
            RFrame::ScanAtom { max, mut started } => {
                if !started {
                    self.atom.clear();
                    started = true;
                }
                loop {
                    while self.rpos < self.wpos {
                        let b = self.buf[self.rpos];
                        if matches!(b, b' ' | b'\r' | b'\n') {
                            return Outcome::Success;
                        }
                        if self.atom.len() == max {
                            tracing::debug!(max, "atom over limit");
                            return Outcome::Failure;
                        }
                        self.atom.push(b);
                        self.rpos += 1;
                    }
                    match self.fill(ch) {
                        Fill::Got => {}
                        Fill::Wait => {
                            self.stack.push(RFrame::ScanAtom { max, started });
                            return Outcome::Wait;
                        }
                        Fill::Closed => return Outcome::Failure,
                    }
                }
            }
            RFrame::ScanQuoted { max, mut state } => {
                if matches!(state, QState::Open) {
                    self.atom.clear();
                }
                loop {
                    while self.rpos < self.wpos {
                        let b = self.buf[self.rpos];
                        self.rpos += 1;
                        match state {
                            QState::Open => {
                                if b != b'"' {
                                    return Outcome::Failure;
                                }
                                state = QState::Body;
                            }
                            QState::Body => match b {
                                b'"' => return Outcome::Success,
                                b'\\' => state = QState::Escape,
                                b'\r' | b'\n' => return Outcome::Failure,
                                _ => {
                                    if self.atom.len() == max {
                                        return Outcome::Failure;
                                    }
                                    self.atom.push(b);
                                }
                            },
                            QState::Escape => {
                                if self.atom.len() == max {
                                    return Outcome::Failure;
                                }
                                self.atom.push(b);
                                state = QState::Body;
                            }
                        }
                    }
                    match self.fill(ch) {
                        Fill::Got => {}
                        Fill::Wait => {
                            self.stack.push(RFrame::ScanQuoted { max, state });
                            return Outcome::Wait;
                        }
                        Fill::Closed => return Outcome::Failure,
                    }
                }
            }
            RFrame::ScanLiteral { mut remaining, mut started } => {
                if !started {
                    self.atom.clear();
                    started = true;
                }
                loop {
                    let avail = (self.wpos - self.rpos) as u64;
                    let take = remaining.min(avail) as usize;
                    self.atom.extend_from_slice(&self.buf[self.rpos..self.rpos + take]);
                    self.rpos += take;
                    remaining -= take as u64;
                    if remaining == 0 {
                        return Outcome::Success;
                    }
                    match self.fill(ch) {
                        Fill::Got => {}
                        Fill::Wait => {
                            self.stack.push(RFrame::ScanLiteral { remaining, started });
                            return Outcome::Wait;
                        }
                        Fill::Closed => return Outcome::Failure,
                    }
                }
            }
            RFrame::ScanCrlf { mut seen_cr } => loop {
                while self.rpos < self.wpos {
                    let b = self.buf[self.rpos];
                    self.rpos += 1;
                    if !seen_cr {
                        if b != b'\r' {
                            return Outcome::Failure;
                        }
                        seen_cr = true;
                    } else if b == b'\n' {
                        return Outcome::Success;
                    } else {
                        return Outcome::Failure;
                    }
                }
                match self.fill(ch) {
                    Fill::Got => {}
                    Fill::Wait => {
                        self.stack.push(RFrame::ScanCrlf { seen_cr });
                        return Outcome::Wait;
                    }
                    Fill::Closed => return Outcome::Failure,
                }
            },
            RFrame::Return(v) => v,
            RFrame::Reinit(mut f) => {
                let mark = self.stack.len();
                self.mark = mark;
                let out = f(self);
                match out {
                    Outcome::Success => Outcome::Success,
                    Outcome::Continue | Outcome::Wait | Outcome::Yield => {
                        self.stack.insert(mark, RFrame::Reinit(f));
                        out
                    }
                    Outcome::Failure => Outcome::Failure,
                }
            }
        }
    }

    fn fill(&mut self, ch: &mut dyn io::Read) -> Fill {
        if self.rpos == self.wpos {
            self.rpos = 0;
            self.wpos = 0;
        } else if self.wpos == self.buf.len() {
            // Compact so a frame parked mid-token keeps making progress.
            self.buf.copy_within(self.rpos..self.wpos, 0);
            self.wpos -= self.rpos;
            self.rpos = 0;
        }
        loop {
            match ch.read(&mut self.buf[self.wpos..]) {
                Ok(0) => return Fill::Closed,
                Ok(n) => {
                    self.wpos += n;
                    return Fill::Got;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Fill::Wait,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(err = ?e, "read channel failed");
                    return Fill::Closed;
                }
            }
        }
    }

    #[inline]
    fn push_frame(&mut self, frame: RFrame) {
        self.stack.insert(self.mark, frame);
    }
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}
