//! Throw-height detector.
//!
//! Turns a stream of accelerometer samples into the height a phone reached
//! when thrown straight up and caught: idle → throwing → free-fall → impact,
//! with an adaptive trigger and a per-session timeout.
//!
//! ```
//! use tossmeter::{DetectorConfig, Phase, Sample, ThrowDetector};
//!
//! let mut detector = ThrowDetector::new(DetectorConfig::default());
//! detector.arm(0.0);
//! detector.process_sample(&Sample::new(10.0, 0.0, 0.0, 9.81));
//! assert_eq!(detector.phase(), Phase::Idle);
//! ```

pub mod config;
pub mod detector;
pub mod error;
pub mod history;
pub mod physics;
pub mod report;
pub mod sensor;
pub mod session;

pub use config::DetectorConfig;
pub use detector::{
    Outcome, Phase, Sample, ThrowDetector, ThrowResult, TimerKind, TimerToken, Transition,
};
pub use error::{ConfigError, DetectorError};
pub use report::{EventSink, JsonLines, SessionEvent};
pub use session::{Input, SessionDriver, SessionOptions, SessionReport};
