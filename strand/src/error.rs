//! Error type shared by the runtime's constructors and configuration layer.
//!
//! Descriptor-level operations keep returning [`std::io::Result`] so that intercepted calls
//! report failures through the same channel as their blocking counterparts.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to allocate fiber stack: {0}")]
    StackAlloc(#[source] io::Error),

    #[error("failed to set up reactor: {0}")]
    Reactor(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
