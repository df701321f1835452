//! Accelerometer sample sources.
//!
//! Every source runs on its own thread and posts [`Input`] messages into the
//! session channel, ending with [`Input::Closed`].

use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::config::STANDARD_GRAVITY;
use crate::detector::Sample;
use crate::physics;
use crate::session::Input;

// ── Wire format ─────────────────────────────────────────────────────────────

/// One JSON line as received. Axes may be null or missing on devices that
/// report partial motion events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSample {
    #[serde(default, alias = "t", alias = "timestampMs")]
    pub timestamp: Option<f64>,
    #[serde(default, alias = "x")]
    pub ax: Option<f64>,
    #[serde(default, alias = "y")]
    pub ay: Option<f64>,
    #[serde(default, alias = "z")]
    pub az: Option<f64>,
}

/// Where sample timestamps come from.
#[derive(Debug, Clone, Copy)]
pub enum Stamping {
    /// Keep the timestamp carried by each line.
    Source,
    /// Replace it with the arrival time, in ms since `epoch`.
    Arrival(Instant),
}

impl Stamping {
    fn stamp(&self, raw_timestamp: Option<f64>) -> Option<f64> {
        match self {
            Stamping::Source => raw_timestamp,
            Stamping::Arrival(epoch) => Some(millis_since(*epoch)),
        }
    }
}

pub fn millis_since(epoch: Instant) -> f64 {
    epoch.elapsed().as_secs_f64() * 1000.0
}

/// Decode one line into a sample, or say why it was rejected.
pub fn parse_line(line: &str, stamping: Stamping) -> Result<Sample, String> {
    let raw: RawSample = serde_json::from_str(line).map_err(|e| format!("bad json: {e}"))?;
    let (Some(ax), Some(ay), Some(az)) = (raw.ax, raw.ay, raw.az) else {
        return Err("missing acceleration axis".into());
    };
    let timestamp_ms = stamping
        .stamp(raw.timestamp)
        .ok_or_else(|| "missing timestamp".to_string())?;
    let sample = Sample::new(timestamp_ms, ax, ay, az);
    if !sample.is_well_formed() {
        return Err("non-finite value".into());
    }
    Ok(sample)
}

// ── Line reader ─────────────────────────────────────────────────────────────

/// Read JSON lines from `reader` on a dedicated thread.
pub fn spawn_json_reader<R>(
    reader: R,
    tx: mpsc::Sender<Input>,
    stamping: Stamping,
) -> thread::JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("sample stream read error: {e}");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let input = match parse_line(trimmed, stamping) {
                Ok(sample) => Input::Sample(sample),
                Err(reason) => Input::Malformed(reason),
            };
            // Receiver gone means the session is over.
            if tx.send(input).is_err() {
                return;
            }
        }
        let _ = tx.send(Input::Closed);
    })
}

// ── Synthetic throws ────────────────────────────────────────────────────────

/// Generates the magnitude profile of a throw-and-catch: rest, a throw spike,
/// a low-magnitude free-fall sized for `height_m`, a catch spike, rest.
#[derive(Debug, Clone)]
pub struct SyntheticThrow {
    pub height_m: f64,
    pub rate_hz: f64,
    pub rest_ms: f64,
    pub gravity: f64,
}

impl Default for SyntheticThrow {
    fn default() -> Self {
        Self {
            height_m: 1.0,
            rate_hz: 50.0,
            rest_ms: 1500.0,
            gravity: STANDARD_GRAVITY,
        }
    }
}

const THROW_SPIKE: f64 = 18.0;
const THROW_MS: f64 = 150.0;
const FREEFALL_LEVEL: f64 = 1.0;
const CATCH_SPIKE: f64 = 15.0;
const CATCH_MS: f64 = 100.0;

impl SyntheticThrow {
    pub fn period_ms(&self) -> f64 {
        1000.0 / self.rate_hz
    }

    pub fn samples(&self) -> Vec<Sample> {
        let period = self.period_ms();
        let free_fall_ms = physics::free_fall_duration(self.height_m, self.gravity) * 1000.0;
        let free_fall_samples = (free_fall_ms / period).round().max(1.0) as usize;

        let mut levels = Vec::new();
        let count = |ms: f64| (ms / period).ceil().max(1.0) as usize;
        levels.extend(std::iter::repeat(0.0).take(count(self.rest_ms)));
        levels.extend(std::iter::repeat(THROW_SPIKE).take(count(THROW_MS)));
        levels.extend(std::iter::repeat(FREEFALL_LEVEL).take(free_fall_samples));
        levels.extend(std::iter::repeat(CATCH_SPIKE).take(count(CATCH_MS)));
        levels.extend(std::iter::repeat(0.0).take(count(self.rest_ms)));

        levels
            .into_iter()
            .enumerate()
            .map(|(i, level)| {
                let (jx, jy) = jitter(i);
                Sample::new(i as f64 * period, level + jx, jy, self.gravity)
            })
            .collect()
    }
}

/// Small deterministic hand tremor, well under every threshold.
fn jitter(i: usize) -> (f64, f64) {
    let phase = i as f64;
    (0.3 * (phase * 0.7).sin(), 0.2 * (phase * 1.3).cos())
}

/// Play samples into the channel, optionally paced at their own timestamps.
pub fn spawn_synthetic(
    samples: Vec<Sample>,
    tx: mpsc::Sender<Input>,
    realtime: bool,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut previous: Option<f64> = None;
        for sample in samples {
            if realtime {
                if let Some(prev) = previous {
                    let gap = (sample.timestamp_ms - prev).max(0.0);
                    thread::sleep(Duration::from_secs_f64(gap / 1000.0));
                }
                previous = Some(sample.timestamp_ms);
            }
            if tx.send(Input::Sample(sample)).is_err() {
                return;
            }
        }
        let _ = tx.send(Input::Closed);
    })
}
