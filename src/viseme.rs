//! Viseme relay to an external renderer
//!
//! Mouth-shape intensity is a latest-value-wins scalar; nothing is buffered.
//! The renderer is an injected capability, never a process-wide global.

use std::sync::Arc;

/// Consumer of mouth-shape intensity values in `[0,1]`.
pub trait VisemeSink: Send + Sync {
    /// Receive the current intensity; always succeeds
    fn update(&self, value: f32);
}

/// Forwards intensity values to whatever renderer is registered.
#[derive(Clone)]
pub struct VisemeRelay {
    sink: Option<Arc<dyn VisemeSink>>,
}

impl VisemeRelay {
    /// Relay into an attached renderer
    #[must_use]
    pub fn new(sink: Arc<dyn VisemeSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Relay with no renderer attached; updates become no-ops
    #[must_use]
    pub fn disconnected() -> Self {
        Self { sink: None }
    }

    /// Forward an intensity value, clamping it to `[0,1]`.
    ///
    /// Non-finite values collapse to `0.0`. Returns the value actually
    /// forwarded.
    pub fn update(&self, value: f32) -> f32 {
        let clamped = if value.is_finite() {
            value.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if let Some(sink) = &self.sink {
            sink.update(clamped);
        }
        clamped
    }
}

impl std::fmt::Debug for VisemeRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisemeRelay")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        values: Mutex<Vec<f32>>,
    }

    impl VisemeSink for Recorder {
        fn update(&self, value: f32) {
            self.values.lock().unwrap().push(value);
        }
    }

    #[test]
    fn values_are_clamped_to_unit_range() {
        let recorder = Arc::new(Recorder {
            values: Mutex::new(Vec::new()),
        });
        let relay = VisemeRelay::new(Arc::clone(&recorder) as Arc<dyn VisemeSink>);

        assert!((relay.update(1.4) - 1.0).abs() < f32::EPSILON);
        assert!((relay.update(-0.3) - 0.0).abs() < f32::EPSILON);
        assert!((relay.update(0.5) - 0.5).abs() < f32::EPSILON);
        assert!((relay.update(f32::NAN) - 0.0).abs() < f32::EPSILON);

        let seen = recorder.values.lock().unwrap();
        assert_eq!(seen.as_slice(), &[1.0, 0.0, 0.5, 0.0]);
    }

    #[test]
    fn detached_relay_is_a_noop() {
        let relay = VisemeRelay::disconnected();
        assert!((relay.update(0.7) - 0.7).abs() < f32::EPSILON);
    }
}
