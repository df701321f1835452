//! Single-threaded session loop.
//!
//! Sources and timers live on helper threads and only talk to the loop
//! through one channel, so samples and timer callbacks are handled strictly in
//! arrival order and the detector itself is never shared.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::DetectorConfig;
use crate::detector::{
    ArmedTimers, Outcome, Sample, ThrowDetector, TimerRequest, TimerToken, Transition,
};
use crate::error::DetectorError;
use crate::report::{EventSink, SessionEvent};
use crate::sensor::millis_since;

/// Messages consumed by the session loop.
#[derive(Debug, Clone)]
pub enum Input {
    Sample(Sample),
    Malformed(String),
    Timer(TimerToken),
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pre-arm countdown in live mode. Samples received meanwhile are dropped.
    pub countdown_ms: u64,
    /// Minimum spacing between gauge events.
    pub gauge_interval_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            countdown_ms: 0,
            gauge_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session: u64,
    pub outcome: Outcome,
    pub samples: u64,
    pub malformed: u64,
}

/// Post `request.token` back into the loop once its delay has passed.
///
/// The thread cannot be cancelled; a token that outlives its session is
/// rejected by the detector's generation check.
pub fn schedule_timer(tx: mpsc::Sender<Input>, request: TimerRequest) {
    thread::spawn(move || {
        thread::sleep(request.delay);
        let _ = tx.send(Input::Timer(request.token));
    });
}

/// Rate limiter for live magnitude updates.
#[derive(Debug, Clone)]
struct GaugeThrottle {
    interval_ms: f64,
    last_ms: Option<f64>,
}

impl GaugeThrottle {
    fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms as f64,
            last_ms: None,
        }
    }

    fn ready(&mut self, at_ms: f64) -> bool {
        match self.last_ms {
            Some(last) if at_ms - last < self.interval_ms => false,
            _ => {
                self.last_ms = Some(at_ms);
                true
            }
        }
    }

    fn reset(&mut self) {
        self.last_ms = None;
    }
}

pub struct SessionDriver<S: EventSink> {
    detector: ThrowDetector,
    sink: S,
    options: SessionOptions,
    gauge: GaugeThrottle,
    samples: u64,
    malformed: u64,
}

impl<S: EventSink> SessionDriver<S> {
    pub fn new(
        config: DetectorConfig,
        options: SessionOptions,
        sink: S,
    ) -> Result<Self, DetectorError> {
        config.validate()?;
        let gauge = GaugeThrottle::new(options.gauge_interval_ms);
        Ok(Self {
            detector: ThrowDetector::new(config),
            sink,
            options,
            gauge,
            samples: 0,
            malformed: 0,
        })
    }

    pub fn detector(&self) -> &ThrowDetector {
        &self.detector
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Run one session against a recorded stream. Sample timestamps are the
    /// only clock: the session is armed at the first sample.
    pub fn run_replay(
        &mut self,
        rx: &mpsc::Receiver<Input>,
    ) -> Result<SessionReport, DetectorError> {
        self.reset_counters();
        loop {
            let input = rx.recv().unwrap_or(Input::Closed);
            if let Input::Sample(sample) = &input {
                if !self.detector.is_active() && self.samples == 0 && sample.is_well_formed() {
                    self.arm(sample.timestamp_ms);
                }
            }
            match input {
                Input::Closed => return self.closed(),
                // Nothing is scheduled in replay; anything else is stale.
                Input::Timer(_) => {}
                other => {
                    if let Some(report) = self.handle(other)? {
                        return Ok(report);
                    }
                }
            }
        }
    }

    /// Run one session against a live source. `epoch` must be the clock the
    /// source stamps samples with. Timers are posted back through `tx`.
    pub fn run_live(
        &mut self,
        rx: &mpsc::Receiver<Input>,
        tx: &mpsc::Sender<Input>,
        epoch: Instant,
    ) -> Result<SessionReport, DetectorError> {
        self.reset_counters();
        if !self.countdown(rx) {
            return Err(DetectorError::SensorUnavailable);
        }

        let timers = self.arm(millis_since(epoch));
        schedule_timer(tx.clone(), timers.settling);
        schedule_timer(tx.clone(), timers.timeout);

        loop {
            let input = rx.recv().unwrap_or(Input::Closed);
            match input {
                Input::Closed => return self.closed(),
                Input::Timer(token) => {
                    let transition = self.detector.fire_timer(token, millis_since(epoch));
                    if let Some(report) = self.after_transition(transition)? {
                        return Ok(report);
                    }
                }
                other => {
                    if let Some(report) = self.handle(other)? {
                        return Ok(report);
                    }
                }
            }
        }
    }

    /// Abandon the running session, if any. Emits nothing.
    pub fn disarm(&mut self) -> bool {
        self.detector.disarm()
    }

    /// Emits one event per remaining second and discards samples until the
    /// countdown ends. Returns false if the source closed meanwhile.
    fn countdown(&mut self, rx: &mpsc::Receiver<Input>) -> bool {
        let mut remaining = Duration::from_millis(self.options.countdown_ms);
        let second = Duration::from_secs(1);
        while !remaining.is_zero() {
            self.sink.emit(&SessionEvent::Countdown {
                remaining_s: remaining.as_secs_f64().ceil() as u64,
            });
            let step = remaining.min(second);
            let deadline = Instant::now() + step;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match rx.recv_timeout(deadline - now) {
                    Ok(Input::Closed) | Err(RecvTimeoutError::Disconnected) => return false,
                    Ok(_) => {}
                    Err(RecvTimeoutError::Timeout) => break,
                }
            }
            remaining -= step;
        }
        if self.options.countdown_ms > 0 {
            self.sink.emit(&SessionEvent::Countdown { remaining_s: 0 });
        }
        true
    }

    fn arm(&mut self, now_ms: f64) -> ArmedTimers {
        let timers = self.detector.arm(now_ms);
        self.gauge.reset();
        tracing::info!(session = self.detector.generation(), "ready, throw the phone upward");
        self.sink.emit(&SessionEvent::Armed {
            session: self.detector.generation(),
            at_ms: now_ms,
        });
        timers
    }

    fn handle(&mut self, input: Input) -> Result<Option<SessionReport>, DetectorError> {
        match input {
            Input::Sample(sample) => {
                if !sample.is_well_formed() {
                    self.reject("non-finite value".into());
                    return Ok(None);
                }
                self.samples += 1;
                let transition = self.detector.process_sample(&sample);
                if self.detector.is_active() {
                    self.update_gauge(sample.timestamp_ms);
                }
                self.after_transition(transition)
            }
            Input::Malformed(reason) => {
                self.reject(reason);
                Ok(None)
            }
            Input::Timer(_) | Input::Closed => Ok(None),
        }
    }

    fn reject(&mut self, reason: String) {
        self.malformed += 1;
        tracing::debug!(%reason, "skipping malformed sample");
        self.sink.emit(&SessionEvent::Malformed { reason });
    }

    fn update_gauge(&mut self, at_ms: f64) {
        let Some(magnitude) = self.detector.last_magnitude() else {
            return;
        };
        if self.gauge.ready(at_ms) {
            self.sink.emit(&SessionEvent::Gauge {
                at_ms,
                magnitude,
                threshold: self.detector.dynamic_threshold(),
            });
        }
    }

    fn after_transition(
        &mut self,
        transition: Option<Transition>,
    ) -> Result<Option<SessionReport>, DetectorError> {
        let Some(transition) = transition else {
            return Ok(None);
        };
        let session = self.detector.generation();
        self.sink.emit(&SessionEvent::phase(session, &transition));

        let Some(outcome) = self.detector.outcome() else {
            return Ok(None);
        };
        if outcome == Outcome::Timeout && self.samples == 0 {
            return Err(DetectorError::SensorUnavailable);
        }
        self.sink.emit(&SessionEvent::result(session, &outcome));
        tracing::info!(
            session,
            status = outcome.as_str(),
            height_m = outcome.height_m(),
            "session finished"
        );
        Ok(Some(SessionReport {
            session,
            outcome,
            samples: self.samples,
            malformed: self.malformed,
        }))
    }

    fn closed(&mut self) -> Result<SessionReport, DetectorError> {
        self.detector.disarm();
        if self.samples == 0 {
            return Err(DetectorError::SensorUnavailable);
        }
        Err(DetectorError::StreamClosed {
            samples: self.samples,
        })
    }

    fn reset_counters(&mut self) {
        self.samples = 0;
        self.malformed = 0;
    }
}
