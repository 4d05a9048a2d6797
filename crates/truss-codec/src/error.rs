use std::io;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("string of {len} bytes over limit {max}")]
    StringLimit { len: u64, max: u64 },
    #[error("container of {len} elements over limit {max}")]
    ContainerLimit { len: u64, max: u64 },
    #[error("stream of {len} bytes over limit {max}")]
    StreamLimit { len: u64, max: u64 },
    #[error("unknown wire type ({protocol}, {kind})")]
    UnknownType { protocol: u8, kind: u8 },
    #[error("type {name} not registered")]
    UnregisteredType { name: &'static str },
    #[error("wire pair ({protocol}, {kind}) already registered")]
    DuplicateType { protocol: u8, kind: u8 },
    #[error("string bytes are not valid utf-8")]
    Utf8,
    #[error("stream io: {kind:?}")]
    StreamIo { kind: io::ErrorKind },
    #[error("scratch stack mismatch")]
    Scratch,
}
