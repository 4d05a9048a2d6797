//! The full request path: bytes arrive at a socket, the actor's reader
//! assembles a command, the writer emits the response without blocking,
//! and the reactor resumes either side on readiness.

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    sync::mpsc,
    time::Duration,
};

use truss::{AcceptStep, Action, Actor, EventFlags, ExecContext, IoStep, Scheduler, SockId};
use truss_proto::{Outcome, Reader, Writer};

const LINE_MAX: usize = 512;

/// `io::Read` over a socket stub: drains the completed receive first,
/// then issues the next one, surfacing `Wait` as `WouldBlock`.
struct SockRead<'a, 'b> {
    ctx: &'a mut ExecContext<'b>,
    sock: SockId,
}

impl io::Read for SockRead<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.ctx.recv_consume(self.sock, buf);
        if n > 0 {
            return Ok(n);
        }
        if self.ctx.recv_in_flight(self.sock) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        match self.ctx.recv(self.sock, 1024) {
            IoStep::Done => Ok(self.ctx.recv_consume(self.sock, buf)),
            IoStep::Wait => Err(io::ErrorKind::WouldBlock.into()),
            IoStep::Error => Ok(0),
        }
    }
}

/// `io::Write` over a socket stub: handing bytes to the stub counts as
/// written; a parked send surfaces as `WouldBlock` until `OUT_DONE`.
struct SockWrite<'a, 'b> {
    ctx: &'a mut ExecContext<'b>,
    sock: SockId,
}

impl io::Write for SockWrite<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.ctx.send_in_flight(self.sock) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        match self.ctx.send(self.sock, buf) {
            IoStep::Done | IoStep::Wait => Ok(buf.len()),
            IoStep::Error => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Phase {
    ReadLine,
    WriteResponse,
}

struct LineConn {
    sock: SockId,
    reader: Reader,
    writer: Writer,
    phase: Phase,
}

impl LineConn {
    fn new(sock: SockId) -> Self {
        let mut reader = Reader::new();
        Self::arm_line(&mut reader);
        Self { sock, reader, writer: Writer::new(), phase: Phase::ReadLine }
    }

    fn arm_line(reader: &mut Reader) {
        reader.push_scan_atom(LINE_MAX);
        reader.push_scan_crlf();
    }

    fn pump(&mut self, ctx: &mut ExecContext<'_>) -> bool {
        if ctx.socket_events(self.sock).contains(EventFlags::ERR_DONE) {
            return false;
        }
        loop {
            match self.phase {
                Phase::ReadLine => {
                    match self.reader.run(&mut SockRead { ctx: &mut *ctx, sock: self.sock }) {
                        Outcome::Success => {
                            let line = self.reader.take_atom();
                            self.writer.push_atom(&b"+OK "[..]);
                            self.writer.push_atom(line);
                            self.writer.push_atom(&b"\r\n"[..]);
                            self.writer.push_flush_all();
                            self.phase = Phase::WriteResponse;
                        }
                        Outcome::Wait | Outcome::Yield => return true,
                        _ => return false,
                    }
                }
                Phase::WriteResponse => {
                    match self.writer.run(&mut SockWrite { ctx: &mut *ctx, sock: self.sock }) {
                        Outcome::Success => {
                            Self::arm_line(&mut self.reader);
                            self.phase = Phase::ReadLine;
                        }
                        Outcome::Wait | Outcome::Yield => return true,
                        _ => return false,
                    }
                }
            }
        }
    }
}

struct LineServer {
    addr_tx: Option<mpsc::Sender<SocketAddr>>,
    listener: Option<SockId>,
    conns: Vec<LineConn>,
}

impl Actor for LineServer {
    fn execute(&mut self, ctx: &mut ExecContext<'_>) -> Action {
        let events = ctx.events();
        if events.contains(EventFlags::KILL) {
            return Action::Close;
        }
        if events.contains(EventFlags::START) {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.set_nonblocking(true).expect("nonblocking");
            let addr = listener.local_addr().expect("local addr");
            self.listener =
                Some(ctx.register_listener(truss::mio::net::TcpListener::from_std(listener)));
            let _ = self.addr_tx.take().expect("start once").send(addr);
        }

        if let Some(lsock) = self.listener {
            loop {
                match ctx.accept(lsock) {
                    AcceptStep::Accepted(stream, _) => {
                        let sock = ctx.register_stream(stream);
                        let mut conn = LineConn::new(sock);
                        if conn.pump(ctx) {
                            self.conns.push(conn);
                        } else {
                            ctx.unregister(sock);
                        }
                    }
                    AcceptStep::Wait => break,
                    AcceptStep::Error => return Action::Close,
                }
            }
        }

        let mut closed = Vec::new();
        for (i, conn) in self.conns.iter_mut().enumerate() {
            if !conn.pump(ctx) {
                ctx.unregister(conn.sock);
                closed.push(i);
            }
        }
        for i in closed.into_iter().rev() {
            self.conns.swap_remove(i);
        }
        Action::Wait
    }
}

#[test]
fn line_protocol_roundtrip() {
    let scheduler = Scheduler::start(1).expect("scheduler");
    let (addr_tx, addr_rx) = mpsc::channel();
    scheduler.schedule(Box::new(LineServer { addr_tx: Some(addr_tx), listener: None, conns: Vec::new() }));
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).expect("bound address");

    let mut stream = std::net::TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");

    stream.write_all(b"ping\r\n").expect("request");
    let mut buf = vec![0u8; b"+OK ping\r\n".len()];
    stream.read_exact(&mut buf).expect("response");
    assert_eq!(buf, b"+OK ping\r\n");

    // Pipelined requests are answered in order.
    stream.write_all(b"one\r\ntwo\r\n").expect("requests");
    let mut buf = vec![0u8; b"+OK one\r\n+OK two\r\n".len()];
    stream.read_exact(&mut buf).expect("responses");
    assert_eq!(buf, b"+OK one\r\n+OK two\r\n");

    scheduler.stop();
}
