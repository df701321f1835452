//! Phase-based throw detector.
//! Tracks one throw attempt from arming to catch and turns the free-fall
//! interval into a height.

use std::time::Duration;

use crate::config::DetectorConfig;
use crate::history::RollingHistory;
use crate::physics;

/// One accelerometer reading, axes in m/s² including gravity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
}

impl Sample {
    pub fn new(timestamp_ms: f64, ax: f64, ay: f64, az: f64) -> Self {
        Self {
            timestamp_ms,
            ax,
            ay,
            az,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.timestamp_ms.is_finite()
            && self.ax.is_finite()
            && self.ay.is_finite()
            && self.az.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrowResult {
    pub height_m: f64,
    pub free_fall_s: f64,
    /// Height before clamping to the realistic maximum.
    pub raw_height_m: f64,
    pub clamped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success(ThrowResult),
    TooShort { free_fall_s: f64 },
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::TooShort { .. } => "too_short",
            Outcome::Timeout => "timeout",
        }
    }

    /// Reported height; failures report 0.
    pub fn height_m(&self) -> f64 {
        match self {
            Outcome::Success(result) => result.height_m,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    Disarmed,
    Idle,
    Throwing,
    FreeFalling,
    Finished(Outcome),
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Disarmed => "disarmed",
            Phase::Idle => "idle",
            Phase::Throwing => "throwing",
            Phase::FreeFalling => "free_falling",
            Phase::Finished(_) => "finished",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Idle | Phase::Throwing | Phase::FreeFalling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Settling,
    SessionTimeout,
}

/// Handle for a scheduled callback, bound to the session that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub generation: u64,
    pub kind: TimerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub token: TimerToken,
    pub delay: Duration,
}

/// Timers the caller must schedule after [`ThrowDetector::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimers {
    pub settling: TimerRequest,
    pub timeout: TimerRequest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub at_ms: f64,
    /// Magnitude of the sample that caused the change, absent for timers.
    pub magnitude: Option<f64>,
}

pub struct ThrowDetector {
    config: DetectorConfig,
    phase: Phase,
    generation: u64,
    history: RollingHistory,
    armed_at_ms: f64,
    settled: bool,
    throw_started_at_ms: Option<f64>,
    free_fall_started_at_ms: Option<f64>,
    last_magnitude: Option<f64>,
}

impl ThrowDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let history = RollingHistory::new(config.history_size);
        Self {
            config,
            phase: Phase::Disarmed,
            generation: 0,
            history,
            armed_at_ms: 0.0,
            settled: false,
            throw_started_at_ms: None,
            free_fall_started_at_ms: None,
            last_magnitude: None,
        }
    }

    /// Start a fresh session at `now_ms`. Any timer handed out earlier goes
    /// stale.
    pub fn arm(&mut self, now_ms: f64) -> ArmedTimers {
        self.generation += 1;
        self.phase = Phase::Idle;
        self.history.clear();
        self.armed_at_ms = now_ms;
        self.settled = false;
        self.throw_started_at_ms = None;
        self.free_fall_started_at_ms = None;
        self.last_magnitude = None;

        tracing::debug!(generation = self.generation, at_ms = now_ms, "armed");

        ArmedTimers {
            settling: TimerRequest {
                token: TimerToken {
                    generation: self.generation,
                    kind: TimerKind::Settling,
                },
                delay: Duration::from_millis(self.config.settling_delay_ms),
            },
            timeout: TimerRequest {
                token: TimerToken {
                    generation: self.generation,
                    kind: TimerKind::SessionTimeout,
                },
                delay: Duration::from_millis(self.config.session_timeout_ms),
            },
        }
    }

    /// Drop the current session. Returns false (and changes nothing) when no
    /// session is running.
    pub fn disarm(&mut self) -> bool {
        if !self.phase.is_active() {
            return false;
        }
        self.generation += 1;
        self.phase = Phase::Disarmed;
        self.history.clear();
        self.settled = false;
        self.throw_started_at_ms = None;
        self.free_fall_started_at_ms = None;
        self.last_magnitude = None;
        tracing::debug!(generation = self.generation, "disarmed");
        true
    }

    /// Feed one sample. Returns the phase change it caused, if any.
    pub fn process_sample(&mut self, sample: &Sample) -> Option<Transition> {
        if !self.phase.is_active() {
            return None;
        }
        if !sample.is_well_formed() {
            tracing::debug!(?sample, "skipping malformed sample");
            return None;
        }

        let now = sample.timestamp_ms;
        if self.elapsed_ms(now) >= self.config.session_timeout_ms as f64 {
            return Some(self.finish(Outcome::Timeout, now, None));
        }

        let mag = physics::magnitude(sample.ax, sample.ay, sample.az, self.config.gravity);
        self.history.push(mag);
        self.last_magnitude = Some(mag);

        if !self.settled {
            if self.elapsed_ms(now) < self.config.settling_delay_ms as f64 {
                return None;
            }
            self.settled = true;
        }

        let threshold = self.dynamic_threshold();

        match self.phase {
            Phase::Idle if mag > threshold => {
                // The settling timer may have fired ahead of the sample clock.
                if self.elapsed_ms(now) < self.config.settling_delay_ms as f64 {
                    tracing::debug!(
                        magnitude = mag,
                        threshold,
                        "ignoring early acceleration spike"
                    );
                    return None;
                }
                self.throw_started_at_ms = Some(now);
                tracing::info!(magnitude = mag, threshold, "throw detected");
                Some(self.transition(Phase::Throwing, now, Some(mag)))
            }
            Phase::Throwing if mag < self.config.freefall_threshold => {
                self.free_fall_started_at_ms = Some(now);
                tracing::info!(magnitude = mag, "free-fall started");
                Some(self.transition(Phase::FreeFalling, now, Some(mag)))
            }
            Phase::FreeFalling if mag > self.config.impact_threshold => {
                let started = self.free_fall_started_at_ms.unwrap_or(now);
                let free_fall_s = (now - started) / 1000.0;
                let outcome = self.score(free_fall_s);
                tracing::info!(
                    magnitude = mag,
                    free_fall_s,
                    outcome = outcome.as_str(),
                    "impact detected"
                );
                Some(self.finish(outcome, now, Some(mag)))
            }
            _ => None,
        }
    }

    /// Deliver a scheduled timer. Stale tokens and tokens for finished
    /// sessions are ignored.
    pub fn fire_timer(&mut self, token: TimerToken, now_ms: f64) -> Option<Transition> {
        if token.generation != self.generation || !self.phase.is_active() {
            tracing::debug!(?token, current = self.generation, "ignoring stale timer");
            return None;
        }
        match token.kind {
            TimerKind::Settling => {
                self.settled = true;
                tracing::debug!("now ready to detect throws");
                None
            }
            TimerKind::SessionTimeout => {
                tracing::info!("session timed out without a complete throw");
                Some(self.finish(Outcome::Timeout, now_ms, None))
            }
        }
    }

    fn score(&self, free_fall_s: f64) -> Outcome {
        if free_fall_s < self.config.min_freefall_time {
            return Outcome::TooShort { free_fall_s };
        }
        let raw = physics::free_fall_height(free_fall_s, self.config.gravity);
        let height = raw.clamp(0.0, self.config.max_realistic_height);
        let clamped = height != raw;
        if clamped {
            tracing::warn!(
                raw_height_m = raw,
                max_m = self.config.max_realistic_height,
                "unrealistic height capped"
            );
        }
        Outcome::Success(ThrowResult {
            height_m: height,
            free_fall_s,
            raw_height_m: raw,
            clamped,
        })
    }

    fn finish(&mut self, outcome: Outcome, at_ms: f64, magnitude: Option<f64>) -> Transition {
        self.transition(Phase::Finished(outcome), at_ms, magnitude)
    }

    fn transition(&mut self, to: Phase, at_ms: f64, magnitude: Option<f64>) -> Transition {
        let from = self.phase;
        self.phase = to;
        Transition {
            from,
            to,
            at_ms,
            magnitude,
        }
    }

    fn elapsed_ms(&self, now_ms: f64) -> f64 {
        now_ms - self.armed_at_ms
    }

    pub fn dynamic_threshold(&self) -> f64 {
        physics::dynamic_threshold(self.history.mean(), self.config.throw_threshold)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.phase {
            Phase::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn history(&self) -> &RollingHistory {
        &self.history
    }

    pub fn last_magnitude(&self) -> Option<f64> {
        self.last_magnitude
    }

    pub fn throw_started_at_ms(&self) -> Option<f64> {
        self.throw_started_at_ms
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}
