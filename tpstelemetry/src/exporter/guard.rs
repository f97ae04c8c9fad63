//! Recovers panics raised while building or sending an export request.
//!
//! A recovered panic is logged with a backtrace truncated to
//! [`MAX_BACKTRACE_LEN`] bytes, counted in `sdk_panic_total` and turned into
//! [`ExportError::Panic`]. Logging itself runs under a second `catch_unwind`
//! so a panicking subscriber cannot escape the guard.
use crate::error::ExportError;
use crate::self_metrics::SelfMetrics;
use crate::tps_error;
use futures_util::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

pub(crate) const MAX_BACKTRACE_LEN: usize = 2048;

/// Runs `f`, converting a panic into an error.
pub(crate) fn catch<T>(
    signal: &'static str,
    metrics: &SelfMetrics,
    f: impl FnOnce() -> T,
) -> Result<T, ExportError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| recovered(signal, metrics, payload))
}

/// Polls `future`, converting a panic into an error.
pub(crate) async fn catch_async<F: Future>(
    signal: &'static str,
    metrics: &SelfMetrics,
    future: F,
) -> Result<F::Output, ExportError> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| recovered(signal, metrics, payload))
}

fn recovered(signal: &'static str, metrics: &SelfMetrics, payload: Box<dyn Any + Send>) -> ExportError {
    let message = panic_message(payload.as_ref());
    metrics.sdk_panic();

    // a panicking subscriber leaves nothing to report through
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        let backtrace = Backtrace::force_capture().to_string();
        tps_error!(
            name: "Exporter.PanicRecovered",
            signal = signal,
            panic = message.as_str(),
            backtrace = truncate(&backtrace, MAX_BACKTRACE_LEN)
        );
    }));

    ExportError::Panic(message)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Longest prefix of `s` that fits in `max` bytes and ends on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
