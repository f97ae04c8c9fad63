use opentelemetry::trace::{SpanId, TraceId};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;

/// Generates trace and span ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// A new non-zero trace id.
    fn new_trace_id(&self) -> TraceId;

    /// A new non-zero span id.
    fn new_span_id(&self) -> SpanId;
}

/// Random ids from a thread-local generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| loop {
            let id = rng.borrow_mut().random::<u128>();
            if id != 0 {
                return TraceId::from(id);
            }
        })
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| loop {
            let id = rng.borrow_mut().random::<u64>();
            if id != 0 {
                return SpanId::from(id);
            }
        })
    }
}

thread_local! {
    static CURRENT_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_valid_and_distinct() {
        let generator = RandomIdGenerator::default();
        let ids: HashSet<_> = (0..1000).map(|_| generator.new_trace_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(!ids.contains(&TraceId::INVALID));
        assert_ne!(generator.new_span_id(), SpanId::INVALID);
    }
}
