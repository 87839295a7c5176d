//! Per-Channel Low-Pass Filter
//!
//! First-order smoother applied to one source's channel vector before the
//! vector is published to the aggregator:
//!
//! ```text
//! output = prev + (input - prev) * (dt / (tau + dt))
//! ```
//!
//! State is one accumulator per channel. When the channel count of the
//! incoming vector differs from the stored state, the state is reseeded from
//! the raw input so that histories of differently-sized vectors never blend.

/// Stateful first-order low-pass filter for one source.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    /// Last filtered output per channel
    state: Vec<f64>,
    enabled: bool,
}

impl Default for LowPassFilter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LowPassFilter {
    pub fn new(enabled: bool) -> Self {
        Self {
            state: Vec::new(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable filtering. Disabling clears the accumulated state.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.state.clear();
        }
        self.enabled = enabled;
    }

    /// Drop the accumulated state; the next sample passes through unchanged.
    pub fn reset(&mut self) {
        self.state.clear();
    }

    /// Current per-channel state (last filtered output).
    pub fn state(&self) -> &[f64] {
        &self.state
    }

    /// Smoothing factor `dt / (tau + dt)`, clamped to `[0, 1]`.
    ///
    /// A zero time constant is a pass-through.
    pub fn alpha(dt_secs: f64, time_constant_secs: f64) -> f64 {
        let denom = time_constant_secs + dt_secs;
        if !(denom > 0.0) {
            return 1.0;
        }
        (dt_secs / denom).clamp(0.0, 1.0)
    }

    /// Filter one raw vector and return the smoothed vector.
    ///
    /// Non-finite inputs are passed through for that sample but never enter
    /// the accumulator, so a single bad reading does not poison later output.
    pub fn filter(&mut self, raw: &[f64], dt_secs: f64, time_constant_secs: f64) -> Vec<f64> {
        if !self.enabled {
            self.state.clear();
            return raw.to_vec();
        }

        if self.state.len() != raw.len() {
            if !self.state.is_empty() {
                tracing::debug!(
                    old = self.state.len(),
                    new = raw.len(),
                    "Channel count changed, reseeding filter state"
                );
            }
            self.state = raw.to_vec();
            return raw.to_vec();
        }

        let alpha = Self::alpha(dt_secs, time_constant_secs);
        let mut out = Vec::with_capacity(raw.len());
        for (prev, &input) in self.state.iter_mut().zip(raw) {
            if !input.is_finite() {
                out.push(input);
                continue;
            }
            if !prev.is_finite() {
                *prev = input;
            } else {
                *prev += (input - *prev) * alpha;
            }
            out.push(*prev);
        }
        out
    }
}
