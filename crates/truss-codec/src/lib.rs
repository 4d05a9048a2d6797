pub mod cross;
mod de;
mod error;
mod limits;
mod ser;
mod typemap;
mod wire;

pub use de::{Deserializer, Scratch};
pub use error::CodecError;
pub use limits::Limits;
pub use ser::{MIN_STREAM_BUFFER, Serializer, Step};
pub use typemap::TypeMap;
pub use wire::{Bits, Wire};
