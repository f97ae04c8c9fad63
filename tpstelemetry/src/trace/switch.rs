use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide tracing toggle.
///
/// Clones share the same flag. When off, tracers hand out non-recording spans,
/// so nothing reaches the processors. The admin `/cmds/*` endpoints flip it.
#[derive(Clone, Debug)]
pub struct TraceSwitch {
    enabled: Arc<AtomicBool>,
}

impl Default for TraceSwitch {
    fn default() -> Self {
        TraceSwitch::new(true)
    }
}

impl TraceSwitch {
    /// Creates a switch in the given state.
    pub fn new(enabled: bool) -> Self {
        TraceSwitch {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    /// Turns tracing on or off.
    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether tracing is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let switch = TraceSwitch::default();
        let other = switch.clone();
        assert!(other.is_enabled());
        switch.set(false);
        assert!(!other.is_enabled());
    }
}
