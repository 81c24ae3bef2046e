use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide gate on new attachments.
///
/// Created once by `SslTracer::new` and shared through `TracerHandle`; dropped
/// with the last handle. Writers are control calls, the reader is the event
/// worker. Turning it off leaves existing attachments alone. Turning it on
/// from off arms a one-shot sweep that the worker consumes on its next drain.
#[derive(Debug)]
pub struct TraceSwitch {
    enabled: AtomicBool,
    sweep_requested: AtomicBool,
}

impl TraceSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            sweep_requested: AtomicBool::new(false),
        }
    }

    pub fn set(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if enabled && !was {
            self.sweep_requested.store(true, Ordering::Release);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Consume a pending off→on sweep request.
    pub fn take_sweep_request(&self) -> bool {
        self.sweep_requested.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_off_to_on_arms_sweep() {
        let switch = TraceSwitch::new(true);
        switch.set(true);
        assert!(!switch.take_sweep_request());

        switch.set(false);
        assert!(!switch.is_enabled());
        assert!(!switch.take_sweep_request());

        switch.set(true);
        assert!(switch.is_enabled());
        assert!(switch.take_sweep_request());
        assert!(!switch.take_sweep_request());
    }

    #[test]
    fn test_repeated_toggles_collapse_to_one_sweep() {
        let switch = TraceSwitch::new(false);
        switch.set(true);
        switch.set(false);
        switch.set(true);
        assert!(switch.take_sweep_request());
        assert!(!switch.take_sweep_request());
    }
}
