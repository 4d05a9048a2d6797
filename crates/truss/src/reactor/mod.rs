mod stub;
mod timeouts;

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use mio::{Events, Poll, Token};
use tracing::{Level, debug, error, span, warn};
use truss_utils::{BufferPool, safe_panic};

use crate::{
    AcceptStep, Action, Actor, ActorId, Directory, Event, EventFlags, HandshakeStep, IoStep,
    PostError, SecureSession,
    reactor::{
        stub::{HsRole, NO_TIMEPOS, PendingRecv, PendingSend, RecvDone, SocketKind, SocketStub},
        timeouts::TimeoutIndex,
    },
};

pub use stub::SockId;

const SOCK_BITS: usize = 10;
const MAX_SOCKETS: usize = 1 << SOCK_BITS;
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// An acceptor takes at most this many connections per readiness wake
/// before rescheduling itself, so a busy listener cannot starve the other
/// actors on its reactor.
pub const MAX_ACCEPT_BATCH: usize = 10;

#[inline]
fn token_of(slot: usize, sock: usize) -> Token {
    Token(slot << SOCK_BITS | sock)
}

#[inline]
fn decode(token: Token) -> (usize, usize) {
    (token.0 >> SOCK_BITS, token.0 & (MAX_SOCKETS - 1))
}

pub(crate) enum InboxMsg {
    Register { actor: Box<dyn Actor>, id: ActorId },
    Post { id: ActorId, event: Event },
    Kill { id: ActorId },
    Stop,
}

/// Cross-thread mailbox of one reactor. Senders enqueue and wake the
/// poller; the reactor drains the queue at the top of every tick, before
/// polling.
pub(crate) struct Inbox {
    queue: Mutex<VecDeque<InboxMsg>>,
    waker: Option<mio::Waker>,
}

impl Inbox {
    pub fn new(waker: mio::Waker) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), waker: Some(waker) }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), waker: None }
    }

    pub fn send(&self, msg: InboxMsg) {
        self.queue.lock().expect("inbox lock").push_back(msg);
        if let Some(waker) = &self.waker
            && let Err(err) = waker.wake()
        {
            error!(?err, "reactor wake failed");
        }
    }

    fn drain(&self) -> VecDeque<InboxMsg> {
        std::mem::take(&mut *self.queue.lock().expect("inbox lock"))
    }
}

pub(crate) struct Entry {
    id: ActorId,
    actor: Option<Box<dyn Actor>>,
    events: EventFlags,
    posted: VecDeque<Event>,
    socks: Vec<Option<SocketStub>>,
    free_socks: Vec<usize>,
    recv_timeouts: TimeoutIndex,
    send_timeouts: TimeoutIndex,
    timer: Option<Instant>,
    queued: bool,
}

/// One reactor per worker thread: hosts a set of actors, polls their
/// sockets and timers, and dispatches each ready actor at most once per
/// tick. Tick order: drain the inbox, poll, translate readiness onto the
/// stubs that requested it, fire expired deadlines, run the ready queue.
pub(crate) struct Reactor {
    index: usize,
    poll: Poll,
    events: Events,
    inbox: Arc<Inbox>,
    directory: Arc<Directory>,
    entries: Vec<Option<Entry>>,
    free_entries: Vec<usize>,
    index_map: HashMap<u32, usize>,
    ready: VecDeque<usize>,
    pool: BufferPool,
    actor_count: Arc<AtomicUsize>,
    stopping: bool,
}

impl Reactor {
    pub fn new(
        index: usize,
        poll: Poll,
        inbox: Arc<Inbox>,
        directory: Arc<Directory>,
        actor_count: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            index,
            poll,
            events: Events::with_capacity(256),
            inbox,
            directory,
            entries: Vec::new(),
            free_entries: Vec::new(),
            index_map: HashMap::new(),
            ready: VecDeque::new(),
            pool: BufferPool::new(),
            actor_count,
            stopping: false,
        }
    }

    pub fn run(&mut self) {
        let _span = span!(Level::INFO, "", reactor = self.index).entered();
        debug!("reactor running");
        loop {
            self.drain_inbox();

            let timeout = if self.ready.is_empty() {
                self.next_deadline().map(|d| d.saturating_duration_since(Instant::now()))
            } else {
                Some(Duration::ZERO)
            };
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // A failing poller syscall is fatal to this reactor.
                    error!(?err, "poller failed, stopping reactor");
                    break;
                }
            }

            let now = Instant::now();
            let events = std::mem::replace(&mut self.events, Events::with_capacity(0));
            for ev in events.iter() {
                if ev.token() != WAKE_TOKEN {
                    self.process_io(ev);
                }
            }
            self.events = events;

            self.process_timeouts(now);
            self.run_ready(now);

            if self.stopping && self.index_map.is_empty() {
                debug!("reactor drained, stopping");
                break;
            }
        }
    }

    // --- tick phases -----------------------------------------------------

    fn drain_inbox(&mut self) {
        for msg in self.inbox.drain() {
            match msg {
                InboxMsg::Register { actor, id } => self.insert_entry(actor, id),
                InboxMsg::Post { id, event } => {
                    let Some(&slot) = self.index_map.get(&id.index) else {
                        debug!(?id, "post for unknown actor dropped");
                        continue;
                    };
                    let entry = self.entries[slot].as_mut().expect("mapped entry exists");
                    if entry.id != id {
                        debug!(?id, "post for stale actor dropped");
                        continue;
                    }
                    entry.posted.push_back(event);
                    entry.events |= EventFlags::RAISE;
                    self.enqueue(slot);
                }
                InboxMsg::Kill { id } => {
                    let Some(&slot) = self.index_map.get(&id.index) else { continue };
                    let entry = self.entries[slot].as_mut().expect("mapped entry exists");
                    if entry.id == id {
                        entry.events |= EventFlags::KILL;
                        self.enqueue(slot);
                    }
                }
                InboxMsg::Stop => {
                    self.stopping = true;
                    for slot in 0..self.entries.len() {
                        if let Some(entry) = self.entries[slot].as_mut() {
                            entry.events |= EventFlags::KILL;
                            self.enqueue(slot);
                        }
                    }
                }
            }
        }
    }

    fn insert_entry(&mut self, actor: Box<dyn Actor>, id: ActorId) {
        let slot = self.free_entries.pop().unwrap_or_else(|| {
            self.entries.push(None);
            self.entries.len() - 1
        });
        self.entries[slot] = Some(Entry {
            id,
            actor: Some(actor),
            events: EventFlags::START,
            posted: VecDeque::new(),
            socks: Vec::new(),
            free_socks: Vec::new(),
            recv_timeouts: TimeoutIndex::new(),
            send_timeouts: TimeoutIndex::new(),
            timer: None,
            queued: false,
        });
        self.index_map.insert(id.index, slot);
        debug!(?id, slot, "actor registered");
        self.enqueue(slot);
    }

    /// Maps one readiness event onto the stub that requested it. A stub
    /// with both a pending send and a pending recv completes either
    /// independently.
    fn process_io(&mut self, ev: &mio::event::Event) {
        let (slot, sock) = decode(ev.token());
        let Some(entry) = self.entries.get_mut(slot).and_then(Option::as_mut) else {
            debug!(?slot, "readiness for vacated actor slot");
            return;
        };
        let Some(stub) = entry.socks.get_mut(sock).and_then(Option::as_mut) else {
            debug!(slot, sock, "readiness for vacated socket slot");
            return;
        };

        let mut add = EventFlags::empty();

        if stub.hs != HsRole::None {
            stub.hs_want = None;
            let step = match &mut stub.kind {
                SocketKind::Secure { stream, session } => session.handshake(stream),
                _ => HandshakeStep::Failed,
            };
            match step {
                HandshakeStep::Done => {
                    add |= match stub.hs {
                        HsRole::Accept => EventFlags::IN_DONE,
                        _ => EventFlags::OUT_DONE,
                    };
                    stub.hs = HsRole::None;
                }
                HandshakeStep::WantRead => stub.hs_want = Some(mio::Interest::READABLE),
                HandshakeStep::WantWrite => stub.hs_want = Some(mio::Interest::WRITABLE),
                HandshakeStep::Failed => {
                    add |= EventFlags::ERR_DONE;
                    stub.hs = HsRole::None;
                }
            }
        } else {
            if ev.is_writable() {
                if stub.connecting {
                    stub.connecting = false;
                    let status = match &mut stub.kind {
                        SocketKind::Stream(s) | SocketKind::Secure { stream: s, .. } => {
                            s.take_error()
                        }
                        _ => Ok(None),
                    };
                    match status {
                        Ok(None) => add |= EventFlags::OUT_DONE,
                        Ok(Some(err)) => {
                            debug!(?err, "connect failed");
                            add |= EventFlags::ERR_DONE;
                        }
                        Err(err) => {
                            debug!(?err, "connect status unavailable");
                            add |= EventFlags::ERR_DONE;
                        }
                    }
                }
                if stub.send.is_some() {
                    add |= pump_send(stub);
                }
            }
            if ev.is_readable() {
                if stub.accept_armed {
                    stub.accept_armed = false;
                    add |= EventFlags::IN_DONE;
                }
                if stub.recv.is_some() {
                    let (flags, release) = pump_recv(stub);
                    add |= flags;
                    if let Some(buf) = release {
                        self.pool.release(buf);
                    }
                }
            }
        }

        if ev.is_error() {
            add |= EventFlags::ERR_DONE;
        }

        stub.events |= add;
        sync_interest(self.poll.registry(), stub, ev.token());

        if add.contains(EventFlags::IN_DONE) {
            disarm_recv(entry, sock);
        }
        if add.contains(EventFlags::OUT_DONE) {
            disarm_send(entry, sock);
        }
        if !add.is_empty() {
            self.enqueue(slot);
        }
    }

    fn process_timeouts(&mut self, now: Instant) {
        for slot in 0..self.entries.len() {
            let fired = {
                let Some(entry) = self.entries[slot].as_mut() else { continue };
                let mut fired = false;
                if let Some(t) = entry.timer
                    && t <= now
                {
                    entry.timer = None;
                    entry.events |= EventFlags::TIMER;
                    fired = true;
                }
                loop {
                    let expired = entry.recv_timeouts.slots().iter().copied().find(|&s| {
                        entry.socks[s]
                            .as_ref()
                            .and_then(|x| x.recv_deadline)
                            .is_some_and(|d| d <= now)
                    });
                    let Some(s) = expired else { break };
                    disarm_recv(entry, s);
                    if let Some(stub) = entry.socks[s].as_mut() {
                        stub.events |= EventFlags::TIMEOUT_RECV;
                    }
                    fired = true;
                }
                loop {
                    let expired = entry.send_timeouts.slots().iter().copied().find(|&s| {
                        entry.socks[s]
                            .as_ref()
                            .and_then(|x| x.send_deadline)
                            .is_some_and(|d| d <= now)
                    });
                    let Some(s) = expired else { break };
                    disarm_send(entry, s);
                    if let Some(stub) = entry.socks[s].as_mut() {
                        stub.events |= EventFlags::TIMEOUT_SEND;
                    }
                    fired = true;
                }
                fired
            };
            if fired {
                self.enqueue(slot);
            }
        }
    }

    fn run_ready(&mut self, now: Instant) {
        let batch = std::mem::take(&mut self.ready);
        for slot in batch {
            let action = {
                let Some(entry) = self.entries.get_mut(slot).and_then(Option::as_mut) else {
                    continue;
                };
                entry.queued = false;
                let mut actor = entry.actor.take().expect("actor parked in its entry");
                let events = std::mem::take(&mut entry.events);
                let mut ctx = ExecContext {
                    entry,
                    mio: self.poll.registry(),
                    pool: &mut self.pool,
                    directory: &self.directory,
                    slot,
                    reactor: self.index,
                    now,
                    events,
                };
                let action = actor.execute(&mut ctx);
                let entry = ctx.entry;
                // One-shot delivery: whatever the actor did not consume is
                // gone.
                for stub in entry.socks.iter_mut().flatten() {
                    stub.events = EventFlags::empty();
                }
                entry.actor = Some(actor);
                action
            };
            match action {
                Action::Reschedule => self.enqueue(slot),
                Action::Wait => {}
                Action::Close => self.close_entry(slot),
            }
        }
    }

    // --- bookkeeping -----------------------------------------------------

    fn enqueue(&mut self, slot: usize) {
        if let Some(entry) = self.entries[slot].as_mut()
            && !entry.queued
        {
            entry.queued = true;
            self.ready.push_back(slot);
        }
    }

    fn close_entry(&mut self, slot: usize) {
        let Some(mut entry) = self.entries[slot].take() else { return };
        for stub in entry.socks.iter_mut().flatten() {
            if stub.registered.is_some()
                && let Err(err) = self.poll.registry().deregister(stub.source())
            {
                debug!(?err, "deregister at close");
            }
            if let Some(pr) = stub.recv.take() {
                self.pool.release(pr.buf);
            }
            if let Some(done) = stub.done.take() {
                self.pool.release(done.buf);
            }
        }
        self.directory.unregister(entry.id);
        self.index_map.remove(&entry.id.index);
        self.free_entries.push(slot);
        self.actor_count.fetch_sub(1, Ordering::Relaxed);
        debug!(id = ?entry.id, "actor closed");
    }

    /// Earliest pending deadline across hosted actors, recomputed from the
    /// timeout indexes (never from all sockets).
    fn next_deadline(&self) -> Option<Instant> {
        let mut min: Option<Instant> = None;
        let mut fold = |d: Instant| min = Some(min.map_or(d, |m| m.min(d)));
        for entry in self.entries.iter().flatten() {
            if let Some(t) = entry.timer {
                fold(t);
            }
            for &s in entry.recv_timeouts.slots() {
                if let Some(d) = entry.socks[s].as_ref().and_then(|x| x.recv_deadline) {
                    fold(d);
                }
            }
            for &s in entry.send_timeouts.slots() {
                if let Some(d) = entry.socks[s].as_ref().and_then(|x| x.send_deadline) {
                    fold(d);
                }
            }
        }
        min
    }
}

/// Drains a pending send as far as the socket allows. Returns the event
/// flags to add.
fn pump_send(stub: &mut SocketStub) -> EventFlags {
    let Some(mut ps) = stub.send.take() else { return EventFlags::empty() };
    loop {
        match stub.write_some(&ps.data[ps.off..], ps.to) {
            Ok(0) => return EventFlags::ERR_DONE,
            Ok(n) => {
                ps.off += n;
                stub.sent += n as u64;
                if ps.off == ps.data.len() {
                    return EventFlags::OUT_DONE;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                stub.send = Some(ps);
                return EventFlags::empty();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(err = ?e, "send resume failed");
                return EventFlags::ERR_DONE;
            }
        }
    }
}

/// Completes a pending receive with one read. Returns the event flags to
/// add plus a buffer to give back to the pool, if the receive died.
fn pump_recv(stub: &mut SocketStub) -> (EventFlags, Option<truss_utils::Buffer>) {
    let Some(mut pr) = stub.recv.take() else { return (EventFlags::empty(), None) };
    let want = pr.want;
    match stub.read_some(&mut pr.buf[..want]) {
        Ok((0, _)) => (EventFlags::ERR_DONE, Some(pr.buf)),
        Ok((n, from)) => {
            stub.received += n as u64;
            let previous = stub.done.replace(RecvDone { buf: pr.buf, len: n, taken: 0, from });
            (EventFlags::IN_DONE, previous.map(|d| d.buf))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            stub.recv = Some(pr);
            (EventFlags::empty(), None)
        }
        Err(e) => {
            debug!(err = ?e, "recv resume failed");
            (EventFlags::ERR_DONE, Some(pr.buf))
        }
    }
}

fn sync_interest(registry: &mio::Registry, stub: &mut SocketStub, token: Token) {
    let desired = stub.desired_interest();
    match (stub.registered, desired) {
        (None, Some(want)) => {
            if let Err(err) = registry.register(stub.source(), token, want) {
                warn!(?err, "socket register failed");
            } else {
                stub.registered = Some(want);
            }
        }
        (Some(_), None) => {
            if let Err(err) = registry.deregister(stub.source()) {
                debug!(?err, "socket deregister failed");
            }
            stub.registered = None;
        }
        (Some(cur), Some(want)) if cur != want => {
            if let Err(err) = registry.reregister(stub.source(), token, want) {
                warn!(?err, "socket reregister failed");
            } else {
                stub.registered = Some(want);
            }
        }
        _ => {}
    }
}

fn disarm_recv(entry: &mut Entry, sock: usize) {
    let Some(stub) = entry.socks[sock].as_mut() else { return };
    let pos = stub.recv_timepos;
    if pos == NO_TIMEPOS {
        return;
    }
    stub.recv_timepos = NO_TIMEPOS;
    stub.recv_deadline = None;
    if let Some(moved) = entry.recv_timeouts.remove(pos)
        && let Some(moved_stub) = entry.socks[moved].as_mut()
    {
        moved_stub.recv_timepos = pos;
    }
}

fn disarm_send(entry: &mut Entry, sock: usize) {
    let Some(stub) = entry.socks[sock].as_mut() else { return };
    let pos = stub.send_timepos;
    if pos == NO_TIMEPOS {
        return;
    }
    stub.send_timepos = NO_TIMEPOS;
    stub.send_deadline = None;
    if let Some(moved) = entry.send_timeouts.remove(pos)
        && let Some(moved_stub) = entry.socks[moved].as_mut()
    {
        moved_stub.send_timepos = pos;
    }
}

/// Per-dispatch view of an actor's reactor entry: the per-socket API plus
/// mailbox and timer access. Only the reactor hosting the actor hands one
/// out, so everything here is single-threaded.
pub struct ExecContext<'a> {
    entry: &'a mut Entry,
    mio: &'a mio::Registry,
    pool: &'a mut BufferPool,
    directory: &'a Directory,
    slot: usize,
    reactor: usize,
    now: Instant,
    events: EventFlags,
}

impl ExecContext<'_> {
    #[inline]
    pub fn id(&self) -> ActorId {
        self.entry.id
    }

    #[inline]
    pub fn now(&self) -> Instant {
        self.now
    }

    #[inline]
    pub fn reactor_index(&self) -> usize {
        self.reactor
    }

    /// Actor-level events for this dispatch (`START`, `KILL`, `RAISE`,
    /// `TIMER`, `UPDATE`). Consumed on delivery.
    #[inline]
    pub fn events(&self) -> EventFlags {
        self.events
    }

    /// Mailbox contents, in posting order.
    pub fn drain_posted(&mut self) -> std::collections::vec_deque::Drain<'_, Event> {
        self.entry.posted.drain(..)
    }

    /// Posts an event to another actor, on whatever reactor hosts it.
    pub fn post(&self, to: ActorId, event: Event) -> Result<(), PostError> {
        let route = self.directory.route(to).ok_or(PostError::StaleActor)?;
        route.inbox.send(InboxMsg::Post { id: to, event });
        Ok(())
    }

    /// Arms the actor-level one-shot timer; re-arming replaces it.
    pub fn set_timer(&mut self, deadline: Instant) {
        self.entry.timer = Some(deadline);
    }

    // --- socket registration ---------------------------------------------

    pub fn register_stream(&mut self, stream: mio::net::TcpStream) -> SockId {
        self.add_stub(SocketKind::Stream(stream))
    }

    pub fn register_listener(&mut self, listener: mio::net::TcpListener) -> SockId {
        self.add_stub(SocketKind::Listener(listener))
    }

    pub fn register_datagram(&mut self, socket: mio::net::UdpSocket) -> SockId {
        self.add_stub(SocketKind::Datagram(socket))
    }

    pub fn register_secure(
        &mut self,
        stream: mio::net::TcpStream,
        session: Box<dyn SecureSession>,
    ) -> SockId {
        self.add_stub(SocketKind::Secure { stream, session })
    }

    /// Removes a socket from the reactor, dropping it and any pending
    /// state.
    pub fn unregister(&mut self, sock: SockId) {
        disarm_recv(self.entry, sock.0);
        disarm_send(self.entry, sock.0);
        let Some(mut stub) = self.entry.socks.get_mut(sock.0).and_then(|slot| slot.take()) else {
            return;
        };
        if stub.registered.is_some()
            && let Err(err) = self.mio.deregister(stub.source())
        {
            debug!(?err, "deregister");
        }
        if let Some(pr) = stub.recv.take() {
            self.pool.release(pr.buf);
        }
        if let Some(done) = stub.done.take() {
            self.pool.release(done.buf);
        }
        self.entry.free_socks.push(sock.0);
    }

    // --- per-socket operations -------------------------------------------

    /// Starts a non-blocking connect; completion arrives as `OUT_DONE`
    /// (or `ERR_DONE`) on the returned socket.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<SockId> {
        let stream = mio::net::TcpStream::connect(addr)?;
        let sock = self.add_stub(SocketKind::Stream(stream));
        if let Some(stub) = self.stub_mut(sock) {
            stub.connecting = true;
        }
        self.sync(sock);
        Ok(sock)
    }

    /// Tries to accept one connection. `Wait` arms readability; the next
    /// try is signalled with `IN_DONE` on the listener.
    pub fn accept(&mut self, sock: SockId) -> AcceptStep {
        let step = {
            let Some(stub) = self.stub_mut(sock) else { return AcceptStep::Error };
            match &mut stub.kind {
                SocketKind::Listener(listener) => match listener.accept() {
                    Ok((stream, addr)) => AcceptStep::Accepted(stream, addr),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        stub.accept_armed = true;
                        AcceptStep::Wait
                    }
                    Err(err) => {
                        debug!(?err, "accept failed");
                        AcceptStep::Error
                    }
                },
                _ => AcceptStep::Error,
            }
        };
        if matches!(step, AcceptStep::Wait) {
            self.sync(sock);
        }
        step
    }

    /// Sends `data`, copying any unwritten remainder for the reactor to
    /// resume; completion of a parked send arrives as `OUT_DONE`.
    pub fn send(&mut self, sock: SockId, data: &[u8]) -> IoStep {
        self.do_send(sock, data, None)
    }

    /// Datagram variant of [`send`](ExecContext::send).
    pub fn send_to(&mut self, sock: SockId, data: &[u8], to: SocketAddr) -> IoStep {
        self.do_send(sock, data, Some(to))
    }

    /// Requests up to `max` bytes. On `Done` the payload is available via
    /// [`recv_payload`](ExecContext::recv_payload) immediately; on `Wait`
    /// the reactor fills the buffer and reports `IN_DONE`.
    pub fn recv(&mut self, sock: SockId, max: usize) -> IoStep {
        let stale = self
            .entry
            .socks
            .get_mut(sock.0)
            .and_then(Option::as_mut)
            .and_then(|stub| stub.done.take());
        if let Some(done) = stale {
            self.pool.release(done.buf);
        }
        let mut buf = self.pool.acquire(max);
        let (step, release) = {
            let Some(stub) = self.entry.socks.get_mut(sock.0).and_then(Option::as_mut) else {
                return IoStep::Error;
            };
            if stub.recv.is_some() {
                safe_panic!("recv while a recv is pending");
                return IoStep::Error;
            }
            match stub.read_some(&mut buf[..max]) {
                Ok((0, _)) => (IoStep::Error, Some(buf)),
                Ok((n, from)) => {
                    stub.received += n as u64;
                    stub.done = Some(RecvDone { buf, len: n, taken: 0, from });
                    (IoStep::Done, None)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    stub.recv = Some(PendingRecv { buf, want: max });
                    (IoStep::Wait, None)
                }
                Err(err) => {
                    debug!(?err, "recv failed");
                    (IoStep::Error, Some(buf))
                }
            }
        };
        if let Some(buf) = release {
            self.pool.release(buf);
        }
        if matches!(step, IoStep::Wait) {
            self.sync(sock);
        }
        step
    }

    /// Datagram variant of [`recv`](ExecContext::recv); the sender address
    /// comes back through [`recv_from_addr`](ExecContext::recv_from_addr).
    pub fn recv_from(&mut self, sock: SockId, max: usize) -> IoStep {
        self.recv(sock, max)
    }

    /// Payload of the last completed receive.
    pub fn recv_payload(&self, sock: SockId) -> Option<&[u8]> {
        let stub = self.entry.socks.get(sock.0)?.as_ref()?;
        stub.done.as_ref().map(|d| &d.buf[d.taken..d.len])
    }

    /// Copies out of the last completed receive, advancing a cursor and
    /// handing the buffer back to the pool once it is exhausted. For
    /// incremental consumers (parsers) that take less than a completion.
    pub fn recv_consume(&mut self, sock: SockId, out: &mut [u8]) -> usize {
        let Some(stub) = self.entry.socks.get_mut(sock.0).and_then(Option::as_mut) else {
            return 0;
        };
        let Some(done) = stub.done.as_mut() else { return 0 };
        let n = (done.len - done.taken).min(out.len());
        out[..n].copy_from_slice(&done.buf[done.taken..done.taken + n]);
        done.taken += n;
        if done.taken == done.len
            && let Some(done) = stub.done.take()
        {
            self.pool.release(done.buf);
        }
        n
    }

    /// A send is parked on this socket; `OUT_DONE` will report its
    /// completion.
    pub fn send_in_flight(&self, sock: SockId) -> bool {
        self.entry
            .socks
            .get(sock.0)
            .and_then(Option::as_ref)
            .is_some_and(|s| s.send.is_some())
    }

    /// A receive is parked on this socket; `IN_DONE` will report its
    /// completion.
    pub fn recv_in_flight(&self, sock: SockId) -> bool {
        self.entry
            .socks
            .get(sock.0)
            .and_then(Option::as_ref)
            .is_some_and(|s| s.recv.is_some())
    }

    /// Sender address of the last completed datagram receive.
    pub fn recv_from_addr(&self, sock: SockId) -> Option<SocketAddr> {
        let stub = self.entry.socks.get(sock.0)?.as_ref()?;
        stub.done.as_ref().and_then(|d| d.from)
    }

    /// Drives the server-side handshake; completion arrives as `IN_DONE`.
    pub fn secure_accept(&mut self, sock: SockId) -> IoStep {
        self.handshake(sock, HsRole::Accept)
    }

    /// Drives the client-side handshake; completion arrives as `OUT_DONE`.
    pub fn secure_connect(&mut self, sock: SockId) -> IoStep {
        self.handshake(sock, HsRole::Connect)
    }

    /// One-shot deadline for the receive side; arming while a previous
    /// deadline is pending replaces it.
    pub fn timeout_recv(&mut self, sock: SockId, deadline: Instant) {
        let entry = &mut *self.entry;
        let Some(stub) = entry.socks.get_mut(sock.0).and_then(Option::as_mut) else { return };
        stub.recv_deadline = Some(deadline);
        if stub.recv_timepos == NO_TIMEPOS {
            stub.recv_timepos = entry.recv_timeouts.insert(sock.0);
        }
    }

    /// One-shot deadline for the send side; arming while a previous
    /// deadline is pending replaces it.
    pub fn timeout_send(&mut self, sock: SockId, deadline: Instant) {
        let entry = &mut *self.entry;
        let Some(stub) = entry.socks.get_mut(sock.0).and_then(Option::as_mut) else { return };
        stub.send_deadline = Some(deadline);
        if stub.send_timepos == NO_TIMEPOS {
            stub.send_timepos = entry.send_timeouts.insert(sock.0);
        }
    }

    /// Completion mask of one socket:
    /// `IN_DONE | OUT_DONE | TIMEOUT_RECV | TIMEOUT_SEND | ERR_DONE`.
    /// Consumed on delivery.
    pub fn socket_events(&self, sock: SockId) -> EventFlags {
        self.entry
            .socks
            .get(sock.0)
            .and_then(Option::as_ref)
            .map_or(EventFlags::empty(), |s| s.events)
    }

    /// Cumulative `(sent, received)` byte counters.
    pub fn socket_counters(&self, sock: SockId) -> (u64, u64) {
        self.entry
            .socks
            .get(sock.0)
            .and_then(Option::as_ref)
            .map_or((0, 0), |s| (s.sent, s.received))
    }

    // --- internals -------------------------------------------------------

    fn do_send(&mut self, sock: SockId, data: &[u8], to: Option<SocketAddr>) -> IoStep {
        let step = {
            let Some(stub) = self.stub_mut(sock) else { return IoStep::Error };
            if stub.send.is_some() || stub.connecting {
                safe_panic!("send while a send is in flight");
                return IoStep::Error;
            }
            let mut off = 0;
            loop {
                if off == data.len() {
                    break IoStep::Done;
                }
                match stub.write_some(&data[off..], to) {
                    Ok(0) => break IoStep::Error,
                    Ok(n) => {
                        off += n;
                        stub.sent += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        stub.send = Some(PendingSend { data: data[off..].to_vec(), off: 0, to });
                        break IoStep::Wait;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        debug!(?err, "send failed");
                        break IoStep::Error;
                    }
                }
            }
        };
        if matches!(step, IoStep::Wait) {
            self.sync(sock);
        }
        step
    }

    fn handshake(&mut self, sock: SockId, role: HsRole) -> IoStep {
        let step = {
            let Some(stub) = self.stub_mut(sock) else { return IoStep::Error };
            stub.hs = role;
            stub.hs_want = None;
            let step = match &mut stub.kind {
                SocketKind::Secure { stream, session } => session.handshake(stream),
                _ => HandshakeStep::Failed,
            };
            match step {
                HandshakeStep::Done => {
                    stub.hs = HsRole::None;
                    IoStep::Done
                }
                HandshakeStep::WantRead => {
                    stub.hs_want = Some(mio::Interest::READABLE);
                    IoStep::Wait
                }
                HandshakeStep::WantWrite => {
                    stub.hs_want = Some(mio::Interest::WRITABLE);
                    IoStep::Wait
                }
                HandshakeStep::Failed => {
                    stub.hs = HsRole::None;
                    IoStep::Error
                }
            }
        };
        if matches!(step, IoStep::Wait) {
            self.sync(sock);
        }
        step
    }

    fn add_stub(&mut self, kind: SocketKind) -> SockId {
        let sock = self.entry.free_socks.pop().unwrap_or_else(|| {
            self.entry.socks.push(None);
            self.entry.socks.len() - 1
        });
        assert!(sock < MAX_SOCKETS, "socket slots exhausted for one actor");
        self.entry.socks[sock] = Some(SocketStub::new(kind));
        SockId(sock)
    }

    fn stub_mut(&mut self, sock: SockId) -> Option<&mut SocketStub> {
        self.entry.socks.get_mut(sock.0).and_then(Option::as_mut)
    }

    fn sync(&mut self, sock: SockId) {
        if let Some(stub) = self.entry.socks.get_mut(sock.0).and_then(Option::as_mut) {
            sync_interest(self.mio, stub, token_of(self.slot, sock.0));
        }
    }
}
