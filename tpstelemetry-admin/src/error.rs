use thiserror::Error;

/// Errors from the admin server and the tracez querier.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdminError {
    /// The listen address could not be bound.
    #[error("failed to bind admin listener on {addr}: {source}")]
    Bind {
        /// Address as configured.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The tracez aggregator has shut down.
    #[error("tracez aggregator is not running")]
    TracezGone,

    /// The gathered metrics could not be encoded.
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    /// A profile was requested while another one is running, or sampling failed.
    #[cfg(feature = "pprof")]
    #[error("profiling failed: {0}")]
    Profile(#[from] pprof::Error),

    /// The profiling task panicked or was cancelled.
    #[cfg(feature = "pprof")]
    #[error("profiling task failed: {0}")]
    ProfileTask(#[from] tokio::task::JoinError),
}
