//! Protocol error taxonomy.
//!
//! Client errors go back as `FrameTypeError` and leave the connection
//! open; fatal errors send the same frame and then close. I/O failures
//! always tear the connection down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{code} {desc}")]
    Client { code: &'static str, desc: String },
    #[error("{code} {desc}")]
    Fatal { code: &'static str, desc: String },
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn client(code: &'static str, desc: impl Into<String>) -> Self {
        Self::Client {
            code,
            desc: desc.into(),
        }
    }

    pub fn fatal(code: &'static str, desc: impl Into<String>) -> Self {
        Self::Fatal {
            code,
            desc: desc.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Client { .. })
    }

    /// Payload of the error frame sent to the peer.
    pub fn wire(&self) -> Vec<u8> {
        match self {
            Self::Client { code, desc } | Self::Fatal { code, desc } => {
                format!("{code} {desc}").into_bytes()
            }
            Self::Io(_) => b"E_INVALID connection error".to_vec(),
        }
    }
}
