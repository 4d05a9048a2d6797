use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::mpsc,
    time::Duration,
};

use truss::{
    Action, Actor, EventFlags, ExecContext, HandshakeStep, IoStep, Scheduler, SecureSession,
    SockId,
};

/// Scripted session: each handshake step pops the next want, so the stub
/// parks on both directions before finishing.
struct ScriptedSession {
    script: VecDeque<HandshakeStep>,
}

impl SecureSession for ScriptedSession {
    fn handshake(&mut self, io: &mut truss::mio::net::TcpStream) -> HandshakeStep {
        match self.script.pop_front() {
            Some(HandshakeStep::WantRead) => {
                // Model a handshake message arriving before progress.
                let mut byte = [0u8; 1];
                match io.read(&mut byte) {
                    Ok(1) => self.script.pop_front().unwrap_or(HandshakeStep::Done),
                    _ => {
                        self.script.push_front(HandshakeStep::WantRead);
                        HandshakeStep::WantRead
                    }
                }
            }
            Some(step) => step,
            None => HandshakeStep::Done,
        }
    }

    fn read(&mut self, io: &mut truss::mio::net::TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        io.read(buf)
    }

    fn write(&mut self, io: &mut truss::mio::net::TcpStream, buf: &[u8]) -> io::Result<usize> {
        io.write(buf)
    }
}

struct SecureDialer {
    stream: Option<std::net::TcpStream>,
    report_tx: mpsc::Sender<EventFlags>,
    sock: Option<SockId>,
}

impl Actor for SecureDialer {
    fn execute(&mut self, ctx: &mut ExecContext<'_>) -> Action {
        let events = ctx.events();
        if events.contains(EventFlags::KILL) {
            return Action::Close;
        }
        if events.contains(EventFlags::START) {
            let stream = self.stream.take().expect("stream handed in");
            stream.set_nonblocking(true).expect("nonblocking");
            let stream = truss::mio::net::TcpStream::from_std(stream);
            let session = ScriptedSession {
                script: [HandshakeStep::WantWrite, HandshakeStep::WantRead, HandshakeStep::Done]
                    .into(),
            };
            let sock = ctx.register_secure(stream, Box::new(session));
            self.sock = Some(sock);
            match ctx.secure_connect(sock) {
                IoStep::Done => {
                    let _ = self.report_tx.send(EventFlags::OUT_DONE);
                    return Action::Close;
                }
                IoStep::Wait => return Action::Wait,
                IoStep::Error => panic!("handshake refused"),
            }
        }
        if let Some(sock) = self.sock {
            let ev = ctx.socket_events(sock);
            if !ev.is_empty() {
                let _ = self.report_tx.send(ev);
                return Action::Close;
            }
        }
        Action::Wait
    }
}

#[test]
fn handshake_parks_on_both_directions() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let peer = std::thread::spawn(move || {
        let (mut peer, _) = listener.accept().expect("accept");
        // Feed the byte the want-read step is parked on.
        std::thread::sleep(Duration::from_millis(20));
        peer.write_all(&[0xA5]).expect("handshake byte");
        peer
    });

    let stream = std::net::TcpStream::connect(addr).expect("connect");
    let scheduler = Scheduler::start(1).expect("scheduler");
    let (report_tx, report_rx) = mpsc::channel();
    scheduler.schedule(Box::new(SecureDialer { stream: Some(stream), report_tx, sock: None }));

    let ev = report_rx.recv_timeout(Duration::from_secs(5)).expect("handshake completion");
    assert!(ev.contains(EventFlags::OUT_DONE), "got {ev:?}");

    let _peer = peer.join().expect("peer thread");
    scheduler.stop();
}
