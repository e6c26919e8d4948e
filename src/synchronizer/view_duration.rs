/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Policies that decide how long a view may run before it times out.

use std::time::{Duration, Instant};

/// Decides the duration of views. The [`Synchronizer`](super::Synchronizer) notifies the policy
/// of view lifecycle events and asks it for the next duration when (re)starting its timer.
pub trait ViewDuration: Send + 'static {
    /// The duration to use for the next view.
    fn duration(&self) -> Duration;

    /// Called when a new view starts.
    fn view_started(&mut self);

    /// Called when a view ends with progress (a QC was observed).
    fn view_succeeded(&mut self);

    /// Called when a view times out.
    fn view_timeout(&mut self);
}

impl ViewDuration for Box<dyn ViewDuration> {
    fn duration(&self) -> Duration {
        (**self).duration()
    }

    fn view_started(&mut self) {
        (**self).view_started()
    }

    fn view_succeeded(&mut self) {
        (**self).view_succeeded()
    }

    fn view_timeout(&mut self) {
        (**self).view_timeout()
    }
}

/// A constant view duration.
pub struct FixedViewDuration(pub Duration);

impl ViewDuration for FixedViewDuration {
    fn duration(&self) -> Duration {
        self.0
    }

    fn view_started(&mut self) {}

    fn view_succeeded(&mut self) {}

    fn view_timeout(&mut self) {}
}

/// An adaptive view duration based on an exponentially weighted moving average of successful
/// view latencies.
///
/// The duration handed to the timer is the EWMA times `multiplier` (headroom over the observed
/// latency), clamped to `[initial, max]`. A timeout multiplies the current duration by
/// `multiplier`; subsequent successes decay it back toward the EWMA-derived target.
pub struct EwmaViewDuration {
    initial: Duration,
    max: Duration,
    multiplier: f64,

    /// Smoothing weight: `1 / samples`.
    alpha: f64,

    ewma_secs: f64,
    current: Duration,
    started_at: Option<Instant>,
}

impl EwmaViewDuration {
    /// Create the policy. `samples` controls how many observations the moving average spans;
    /// `multiplier` is both the headroom factor over the average and the timeout backoff factor.
    pub fn new(initial: Duration, max: Duration, multiplier: f64, samples: u32) -> Self {
        assert!(multiplier >= 1.0, "multiplier must be at least 1");
        assert!(samples > 0, "samples must be positive");
        Self {
            initial,
            max,
            multiplier,
            alpha: 1.0 / samples as f64,
            ewma_secs: initial.as_secs_f64(),
            current: initial,
            started_at: None,
        }
    }

    fn clamp(&self, duration: Duration) -> Duration {
        duration.max(self.initial).min(self.max)
    }
}

impl ViewDuration for EwmaViewDuration {
    fn duration(&self) -> Duration {
        self.current
    }

    fn view_started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    fn view_succeeded(&mut self) {
        if let Some(started_at) = self.started_at.take() {
            let observed = started_at.elapsed().as_secs_f64();
            self.ewma_secs = (1.0 - self.alpha) * self.ewma_secs + self.alpha * observed;
        }
        self.current = self.clamp(Duration::from_secs_f64(self.ewma_secs * self.multiplier));
    }

    fn view_timeout(&mut self) {
        self.started_at = None;
        self.current = self.clamp(self.current.mul_f64(self.multiplier));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_back_off_and_are_clamped() {
        let mut duration = EwmaViewDuration::new(
            Duration::from_millis(100),
            Duration::from_millis(400),
            2.0,
            8,
        );
        assert_eq!(duration.duration(), Duration::from_millis(100));
        duration.view_timeout();
        assert_eq!(duration.duration(), Duration::from_millis(200));
        duration.view_timeout();
        assert_eq!(duration.duration(), Duration::from_millis(400));
        duration.view_timeout();
        // Clamped at max.
        assert_eq!(duration.duration(), Duration::from_millis(400));
    }

    #[test]
    fn success_decays_toward_observed_latency() {
        let mut duration = EwmaViewDuration::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
            8,
        );
        for _ in 0..3 {
            duration.view_timeout();
        }
        let backed_off = duration.duration();
        // Fast views pull the duration back down toward 2x the (near-zero) observed latency,
        // clamped at the initial duration.
        for _ in 0..64 {
            duration.view_started();
            duration.view_succeeded();
        }
        assert!(duration.duration() < backed_off);
        assert!(duration.duration() >= Duration::from_millis(100));
    }
}
