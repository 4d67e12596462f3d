//! Error and Result types for the kobwire crate.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("hardware interface unavailable: {0}")]
    Hardware(String),

    #[error("audio unavailable: {0}")]
    Audio(String),

    #[error("wire error: {0}")]
    Wire(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("recording error: {0}")]
    Recording(String),

    #[error("not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
