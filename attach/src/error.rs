use std::{io, path::PathBuf};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("port pool exhausted: all {capacity} ports from {start} are in use")]
    PoolExhausted { start: u16, capacity: u16 },

    #[error("no IPv4 address allocated: {0}")]
    NoIPv4Allocated(String),

    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("failed to mount {}: {source}", path.display())]
    Mount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Cell(#[from] netpol_cell::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn plugin(plugin: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }
}
