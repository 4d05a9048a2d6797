use std::io;

/// Progress of a handshake step. The want variants feed the reactor's
/// interest mask, so a step can park on either direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    Done,
    WantRead,
    WantWrite,
    Failed,
}

/// Thin secure-transport session driven over a non-blocking TCP stream.
/// Providers bind their TLS implementation behind this; the reactor only
/// schedules handshake steps and frames reads/writes through the session.
pub trait SecureSession: Send {
    /// Advances the handshake as far as the socket allows.
    fn handshake(&mut self, io: &mut mio::net::TcpStream) -> HandshakeStep;

    fn read(&mut self, io: &mut mio::net::TcpStream, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, io: &mut mio::net::TcpStream, buf: &[u8]) -> io::Result<usize>;
}
