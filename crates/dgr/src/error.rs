use std::io;

use crate::wire::ProtocolError;

/// Errors surfaced by the DGR context.
///
/// Everything except [`DgrError::Protocol`] is fatal for the calling process:
/// it means either the cooperating processes disagree about their variables or
/// the local network stack is broken. Protocol errors are recovered inside
/// `update()` and only appear when decoding datagrams by hand.
#[derive(Debug, thiserror::Error)]
pub enum DgrError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid variable name {name:?}: must be 1..=255 bytes")]
    InvalidName { name: String },

    #[error(
        "variable {name:?} registered with {registered} bytes, now declared with {requested} bytes"
    )]
    SizeMismatch {
        name: String,
        registered: usize,
        requested: usize,
    },

    #[error("frame of {size} bytes exceeds the maximum UDP payload")]
    PacketTooLarge { size: usize },

    #[error("{context}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl DgrError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { context, source }
    }
}

pub type Result<T, E = DgrError> = std::result::Result<T, E>;
