//! CPU profiling for `/debug/pprof/profile`.
use crate::error::AdminError;
use std::time::Duration;

/// Profile length when the request does not name one.
pub const DEFAULT_PROFILE_DURATION: Duration = Duration::from_secs(30);
/// Longest profile a request may ask for.
pub const MAX_PROFILE_DURATION: Duration = Duration::from_secs(300);

const FREQUENCY: i32 = 99;
const BLOCKLIST: [&str; 4] = ["libc", "libgcc", "pthread", "vdso"];

/// Samples the whole process for `duration` and returns a flamegraph SVG.
///
/// Only one profile can run at a time; a concurrent request fails.
pub async fn profile(duration: Duration) -> Result<Vec<u8>, AdminError> {
    let duration = duration.min(MAX_PROFILE_DURATION);
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>, AdminError> {
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(FREQUENCY)
            .blocklist(&BLOCKLIST)
            .build()?;
        std::thread::sleep(duration);
        let report = guard.report().build()?;
        let mut svg = Vec::new();
        report.flamegraph(&mut svg)?;
        Ok(svg)
    })
    .await?
}
