//! Error types for the communication layer.
//!
//! Only initialization can fail recoverably. Once the layer is up,
//! data-path operations either succeed or terminate the process; see
//! [`crate::Comm`] for the fatal-error policy.

use std::io;

/// Initialization and configuration errors.
#[derive(Debug)]
pub enum Error {
    /// Provider selection found nothing satisfying the fundamental
    /// requirements.
    NoProvider { prov_name: Option<String> },
    /// Basic registration mode requires a fixed heap, none was given.
    NoFixedHeap { prov_name: String },
    /// IO error from the fabric layer.
    Io(io::Error),
    /// Out-of-band exchange produced inconsistent data.
    OobMismatch(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NoProvider { prov_name } => write!(
                f,
                "no fabric provider for prov_name \"{}\"",
                prov_name.as_deref().unwrap_or("<any>")
            ),
            Error::NoFixedHeap { prov_name } => {
                write!(f, "must specify fixed heap with {prov_name} provider")
            }
            Error::Io(e) => write!(f, "fabric error: {e}"),
            Error::OobMismatch(what) => write!(f, "out-of-band exchange mismatch: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for initialization paths.
pub type Result<T> = std::result::Result<T, Error>;

/// Render the diagnostic for hitting the open-file limit.
///
/// Some providers open many files (sockets per connected endpoint), so
/// a job can exhaust a reasonable ulimit once the node count times the
/// transmit-context count grows. Explain that instead of just failing.
pub(crate) fn open_file_limit_msg(num_nodes: usize, num_tx_ctxs: usize) -> String {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    format!(
        "the program has reached the limit on the number of open files. \
         This may be because the product of the number of nodes ({num_nodes}) \
         and the communication concurrency (roughly {num_tx_ctxs}) is a \
         significant fraction of the open-file limit ({limit}). If so, either \
         set COMM_CONCURRENCY to decrease communication concurrency or raise \
         the open-file ulimit."
    )
}
