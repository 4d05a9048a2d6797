use std::{io, net::SocketAddr, time::Instant};

use mio::{
    Interest,
    net::{TcpListener, TcpStream, UdpSocket},
};
use truss_utils::Buffer;

use crate::{EventFlags, SecureSession};

/// Index of a socket slot within its owning actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockId(pub(crate) usize);

pub(crate) const NO_TIMEPOS: usize = usize::MAX;

pub(crate) enum SocketKind {
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
    Secure { stream: TcpStream, session: Box<dyn SecureSession> },
}

/// A send in flight: the unwritten remainder, resumed on writability.
pub(crate) struct PendingSend {
    pub data: Vec<u8>,
    pub off: usize,
    pub to: Option<SocketAddr>,
}

/// A receive in flight: the reactor fills `buf` when readability fires.
pub(crate) struct PendingRecv {
    pub buf: Buffer,
    pub want: usize,
}

/// A completed receive, held until the actor picks it up or issues the
/// next one. `taken` tracks incremental consumption.
pub(crate) struct RecvDone {
    pub buf: Buffer,
    pub len: usize,
    pub taken: usize,
    pub from: Option<SocketAddr>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum HsRole {
    None,
    Accept,
    Connect,
}

/// Per-socket record inside a reactor entry.
///
/// Invariant: a populated `send` means a send is in flight and the stub
/// holds WRITABLE interest until it drains; same for `recv` and READABLE.
/// An armed deadline on either direction keeps the stub's position in the
/// owning entry's timeout index of that side.
pub(crate) struct SocketStub {
    pub kind: SocketKind,
    /// Interest currently registered with the poller, if any.
    pub registered: Option<Interest>,
    pub send: Option<PendingSend>,
    pub recv: Option<PendingRecv>,
    pub done: Option<RecvDone>,
    pub events: EventFlags,
    pub sent: u64,
    pub received: u64,
    pub recv_deadline: Option<Instant>,
    pub send_deadline: Option<Instant>,
    pub recv_timepos: usize,
    pub send_timepos: usize,
    pub connecting: bool,
    pub accept_armed: bool,
    pub hs: HsRole,
    pub hs_want: Option<Interest>,
}

impl SocketStub {
    pub fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            registered: None,
            send: None,
            recv: None,
            done: None,
            events: EventFlags::empty(),
            sent: 0,
            received: 0,
            recv_deadline: None,
            send_deadline: None,
            recv_timepos: NO_TIMEPOS,
            send_timepos: NO_TIMEPOS,
            connecting: false,
            accept_armed: false,
            hs: HsRole::None,
            hs_want: None,
        }
    }

    /// Interest implied by the pending operations.
    pub fn desired_interest(&self) -> Option<Interest> {
        let mut want_read = self.recv.is_some() || self.accept_armed;
        let mut want_write = self.send.is_some() || self.connecting;
        if let Some(w) = self.hs_want {
            want_read |= w.is_readable();
            want_write |= w.is_writable();
        }
        match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub fn source(&mut self) -> &mut dyn mio::event::Source {
        match &mut self.kind {
            SocketKind::Listener(l) => l,
            SocketKind::Stream(s) => s,
            SocketKind::Datagram(d) => d,
            SocketKind::Secure { stream, .. } => stream,
        }
    }

    /// One non-blocking write of `data`, routed through the kind.
    pub fn write_some(&mut self, data: &[u8], to: Option<SocketAddr>) -> io::Result<usize> {
        match &mut self.kind {
            SocketKind::Stream(s) => io::Write::write(s, data),
            SocketKind::Secure { stream, session } => session.write(stream, data),
            SocketKind::Datagram(d) => match to {
                Some(addr) => d.send_to(data, addr),
                None => d.send(data),
            },
            SocketKind::Listener(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    /// One non-blocking read into `buf`, routed through the kind. Returns
    /// the byte count and, for datagrams, the sender.
    pub fn read_some(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        match &mut self.kind {
            SocketKind::Stream(s) => io::Read::read(s, buf).map(|n| (n, None)),
            SocketKind::Secure { stream, session } => {
                session.read(stream, buf).map(|n| (n, None))
            }
            SocketKind::Datagram(d) => d.recv_from(buf).map(|(n, addr)| (n, Some(addr))),
            SocketKind::Listener(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }
}
