use std::{net::SocketAddr, sync::mpsc, time::Duration};

use truss::{Action, Actor, EventFlags, ExecContext, IoStep, Scheduler, SockId};

/// Bounces every datagram back to its sender.
struct DatagramEcho {
    addr_tx: Option<mpsc::Sender<SocketAddr>>,
    sock: Option<SockId>,
}

impl DatagramEcho {
    fn bounce(&self, ctx: &mut ExecContext<'_>) -> bool {
        let sock = self.sock.expect("socket registered");
        loop {
            let Some(payload) = ctx.recv_payload(sock).map(<[u8]>::to_vec) else { return true };
            let Some(peer) = ctx.recv_from_addr(sock) else { return false };
            if ctx.send_to(sock, &payload, peer) == IoStep::Error {
                return false;
            }
            // Re-arm; a datagram may already be queued.
            match ctx.recv_from(sock, 2048) {
                IoStep::Done => {}
                IoStep::Wait => return true,
                IoStep::Error => return false,
            }
        }
    }
}

impl Actor for DatagramEcho {
    fn execute(&mut self, ctx: &mut ExecContext<'_>) -> Action {
        let events = ctx.events();
        if events.contains(EventFlags::KILL) {
            return Action::Close;
        }
        if events.contains(EventFlags::START) {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
            socket.set_nonblocking(true).expect("nonblocking");
            let addr = socket.local_addr().expect("local addr");
            let sock = ctx.register_datagram(truss::mio::net::UdpSocket::from_std(socket));
            self.sock = Some(sock);
            let _ = self.addr_tx.take().expect("start once").send(addr);
            return match ctx.recv_from(sock, 2048) {
                IoStep::Done => {
                    if self.bounce(ctx) { Action::Wait } else { Action::Close }
                }
                IoStep::Wait => Action::Wait,
                IoStep::Error => Action::Close,
            };
        }
        if let Some(sock) = self.sock {
            let ev = ctx.socket_events(sock);
            if ev.contains(EventFlags::ERR_DONE) {
                return Action::Close;
            }
            if ev.contains(EventFlags::IN_DONE) && !self.bounce(ctx) {
                return Action::Close;
            }
        }
        Action::Wait
    }
}

#[test]
fn datagram_station_echoes_to_sender() {
    let scheduler = Scheduler::start(1).expect("scheduler");
    let (addr_tx, addr_rx) = mpsc::channel();
    let id = scheduler.schedule(Box::new(DatagramEcho { addr_tx: Some(addr_tx), sock: None }));
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).expect("bound address");

    let client = std::net::UdpSocket::bind("127.0.0.1:0").expect("client bind");
    client.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");

    for round in 0..3u8 {
        let msg = [b'd', b'g', round];
        client.send_to(&msg, addr).expect("send");
        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).expect("echo");
        assert_eq!(&buf[..n], msg);
        assert_eq!(from, addr);
    }

    scheduler.post_kill(id).expect("kill");
    scheduler.stop();
}
