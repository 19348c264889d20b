use std::io;
use std::path::PathBuf;

/// Errors surfaced by the capture server and its adapters.
///
/// Only start-up errors are fatal: once an adapter is serving, every failure
/// is translated into a typed payload on the wire instead of being propagated
/// out of the handler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listening socket could not be bound. Fatal: the process exits
    /// before publishing an address.
    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The path-intercept directory could not be created or populated.
    #[error("failed to set up intercept directory {path}: {source}")]
    Intercept {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The replay journal could not be read at start-up.
    #[error("failed to read replay journal {path}: {source}")]
    ReplayJournal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The record journal could not be opened for writing.
    #[error("failed to open record journal {path}: {source}")]
    RecordJournal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The live request matched nothing in the replay index.
    ///
    /// Adapters render this on the wire: line-oriented transports emit a
    /// `CAPTUREMOCK MISMATCH` payload, HTTP answers with a descriptive 4xx,
    /// command-line shims prefix stderr and exit non-zero.
    #[error("CAPTUREMOCK MISMATCH: {0}")]
    ReplayMismatch(String),

    /// A configuration file could not be read or parsed.
    #[error("failed to load configuration {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// The AMQP broker connection failed at start-up.
    #[error("failed to connect to AMQP broker at {url}: {reason}")]
    Broker { url: String, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
