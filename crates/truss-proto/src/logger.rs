/// Sink receiving a transcript of everything a [`Writer`](crate::Writer)
/// emits: one call per logged char, atom and flush. Silent emissions skip
/// the sink entirely.
pub trait Transcript: Send {
    fn write_char(&mut self, c: u8);
    fn write_atom(&mut self, data: &[u8]);
    fn write_flush(&mut self);
}
