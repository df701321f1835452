//! Session events and where they go.

use std::io::Write;

use serde::Serialize;

use crate::detector::{Outcome, Transition};

/// Everything a presentation layer hears about a session, one JSON object
/// per event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Countdown {
        remaining_s: u64,
    },
    Armed {
        session: u64,
        at_ms: f64,
    },
    Gauge {
        at_ms: f64,
        magnitude: f64,
        threshold: f64,
    },
    Phase {
        session: u64,
        from: &'static str,
        to: &'static str,
        at_ms: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        magnitude: Option<f64>,
    },
    Result {
        session: u64,
        status: &'static str,
        height_m: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        free_fall_s: Option<f64>,
        clamped: bool,
    },
    Malformed {
        reason: String,
    },
}

impl SessionEvent {
    pub fn phase(session: u64, transition: &Transition) -> Self {
        SessionEvent::Phase {
            session,
            from: transition.from.as_str(),
            to: transition.to.as_str(),
            at_ms: transition.at_ms,
            magnitude: transition.magnitude,
        }
    }

    pub fn result(session: u64, outcome: &Outcome) -> Self {
        let (free_fall_s, clamped) = match outcome {
            Outcome::Success(result) => (Some(result.free_fall_s), result.clamped),
            Outcome::TooShort { free_fall_s } => (Some(*free_fall_s), false),
            Outcome::Timeout => (None, false),
        };
        SessionEvent::Result {
            session,
            status: outcome.as_str(),
            height_m: outcome.height_m(),
            free_fall_s,
            clamped,
        }
    }
}

pub trait EventSink {
    fn emit(&mut self, event: &SessionEvent);
}

/// Collects events in memory.
impl EventSink for Vec<SessionEvent> {
    fn emit(&mut self, event: &SessionEvent) {
        self.push(event.clone());
    }
}

impl EventSink for Vec<Box<dyn EventSink + Send>> {
    fn emit(&mut self, event: &SessionEvent) {
        for sink in self.iter_mut() {
            sink.emit(event);
        }
    }
}

/// Writes one JSON object per line and flushes after each.
pub struct JsonLines<W: Write> {
    out: W,
}

impl<W: Write> JsonLines<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EventSink for JsonLines<W> {
    fn emit(&mut self, event: &SessionEvent) {
        let written = serde_json::to_string(event)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                writeln!(self.out, "{json}")?;
                self.out.flush()
            });
        if let Err(e) = written {
            tracing::warn!("failed to write event: {e}");
        }
    }
}

#[cfg(unix)]
pub use socket::SocketBroadcast;

#[cfg(unix)]
mod socket {
    use std::io::{self, Write};
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::{EventSink, SessionEvent};

    /// A client that cannot take a line within this is dropped.
    const WRITE_TIMEOUT: Duration = Duration::from_millis(50);
    const ACCEPT_POLL: Duration = Duration::from_millis(100);

    /// Broadcasts events to every client connected to a Unix socket.
    pub struct SocketBroadcast {
        path: PathBuf,
        clients: Arc<Mutex<Vec<UnixStream>>>,
        running: Arc<AtomicBool>,
        accept_thread: Option<thread::JoinHandle<()>>,
    }

    /// Remove `path` if it is a socket left behind by an earlier run. Anything
    /// else at that path is an error and is left alone.
    fn remove_stale_socket(path: &Path) -> io::Result<()> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a socket", path.display()),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    impl SocketBroadcast {
        /// Bind `path`, replacing a stale socket, and accept clients in the
        /// background until dropped.
        pub fn bind(path: &Path) -> io::Result<Self> {
            remove_stale_socket(path)?;
            let listener = UnixListener::bind(path)?;
            // Let unprivileged UIs connect.
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
            listener.set_nonblocking(true)?;

            let clients: Arc<Mutex<Vec<UnixStream>>> = Arc::new(Mutex::new(Vec::new()));
            let running = Arc::new(AtomicBool::new(true));
            let clients_accept = Arc::clone(&clients);
            let running_accept = Arc::clone(&running);
            let accept_thread = thread::spawn(move || {
                while running_accept.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(e) = prepare_client(&stream) {
                                tracing::warn!("rejecting client: {e}");
                                continue;
                            }
                            tracing::info!("client connected");
                            match clients_accept.lock() {
                                Ok(mut clients) => clients.push(stream),
                                Err(_) => return,
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            tracing::warn!("accept error: {e}");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
            });

            Ok(Self {
                path: path.to_path_buf(),
                clients,
                running,
                accept_thread: Some(accept_thread),
            })
        }

        pub fn client_count(&self) -> usize {
            self.clients.lock().map(|c| c.len()).unwrap_or(0)
        }
    }

    fn prepare_client(stream: &UnixStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))
    }

    impl EventSink for SocketBroadcast {
        fn emit(&mut self, event: &SessionEvent) {
            let json = match serde_json::to_string(event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("failed to encode event: {e}");
                    return;
                }
            };
            let Ok(mut clients) = self.clients.lock() else {
                return;
            };
            // A stalled reader times out here and is dropped with the rest.
            clients.retain_mut(|stream| {
                match writeln!(stream, "{json}").and_then(|_| stream.flush()) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::info!("client disconnected: {e}");
                        false
                    }
                }
            });
        }
    }

    impl Drop for SocketBroadcast {
        fn drop(&mut self) {
            self.running.store(false, Ordering::Relaxed);
            if let Some(handle) = self.accept_thread.take() {
                let _ = handle.join();
            }
            let _ = remove_stale_socket(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Phase, ThrowResult};

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(SessionEvent::Countdown { remaining_s: 2 }).unwrap();
        assert_eq!(json["event"], "countdown");
        assert_eq!(json["remaining_s"], 2);
    }

    #[test]
    fn phase_event_from_transition() {
        let transition = Transition {
            from: Phase::Idle,
            to: Phase::Throwing,
            at_ms: 1500.0,
            magnitude: Some(16.0),
        };
        let json = serde_json::to_value(SessionEvent::phase(3, &transition)).unwrap();
        assert_eq!(json["event"], "phase");
        assert_eq!(json["from"], "idle");
        assert_eq!(json["to"], "throwing");
        assert_eq!(json["magnitude"], 16.0);

        let timeout = Transition {
            from: Phase::Idle,
            to: Phase::Finished(Outcome::Timeout),
            at_ms: 20_000.0,
            magnitude: None,
        };
        let json = serde_json::to_value(SessionEvent::phase(3, &timeout)).unwrap();
        assert!(json.get("magnitude").is_none());
    }

    #[test]
    fn result_event_carries_height() {
        let outcome = Outcome::Success(ThrowResult {
            height_m: 20.0,
            free_fall_s: 5.0,
            raw_height_m: 30.65625,
            clamped: true,
        });
        match SessionEvent::result(1, &outcome) {
            SessionEvent::Result {
                status,
                height_m,
                free_fall_s,
                clamped,
                ..
            } => {
                assert_eq!(status, "success");
                assert_eq!(height_m, 20.0);
                assert_eq!(free_fall_s, Some(5.0));
                assert!(clamped);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let json = serde_json::to_value(SessionEvent::result(1, &Outcome::Timeout)).unwrap();
        assert_eq!(json["status"], "timeout");
        assert_eq!(json["height_m"], 0.0);
        assert!(json.get("free_fall_s").is_none());
    }

    #[test]
    fn json_lines_writes_one_object_per_line() {
        let mut sink = JsonLines::new(Vec::<u8>::new());
        sink.emit(&SessionEvent::Countdown { remaining_s: 1 });
        sink.emit(&SessionEvent::Malformed {
            reason: "bad json".into(),
        });
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"event\":\"malformed\""));
    }

    struct Counter(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl EventSink for Counter {
        fn emit(&mut self, _event: &SessionEvent) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut sinks: Vec<Box<dyn EventSink + Send>> = vec![
            Box::new(Counter(seen.clone())),
            Box::new(JsonLines::new(Vec::<u8>::new())),
            Box::new(Counter(seen.clone())),
        ];
        sinks.emit(&SessionEvent::Countdown { remaining_s: 0 });
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[test]
    fn socket_broadcast_delivers_to_clients() {
        use std::io::{BufRead, BufReader};
        use std::os::unix::net::UnixStream;
        use std::time::{Duration, Instant};

        let path = std::env::temp_dir()
            .join(format!("tossmeter-test-{}.sock", std::process::id()));
        let mut broadcast = SocketBroadcast::bind(&path).unwrap();
        let client = UnixStream::connect(&path).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while broadcast.client_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(broadcast.client_count(), 1);

        broadcast.emit(&SessionEvent::Countdown { remaining_s: 2 });
        let mut line = String::new();
        BufReader::new(client).read_line(&mut line).unwrap();
        assert!(line.contains("countdown"));

        drop(broadcast);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn stalled_client_is_dropped_instead_of_blocking() {
        use std::os::unix::net::UnixStream;
        use std::sync::mpsc;
        use std::time::{Duration, Instant};

        let path = std::env::temp_dir()
            .join(format!("tossmeter-stall-{}.sock", std::process::id()));
        let mut broadcast = SocketBroadcast::bind(&path).unwrap();
        // connected, never read
        let _client = UnixStream::connect(&path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while broadcast.client_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(broadcast.client_count(), 1);

        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let event = SessionEvent::Malformed {
                reason: "x".repeat(1024),
            };
            for _ in 0..100_000 {
                broadcast.emit(&event);
                if broadcast.client_count() == 0 {
                    break;
                }
            }
            let _ = done_tx.send(broadcast.client_count());
        });
        let remaining = done_rx
            .recv_timeout(Duration::from_secs(20))
            .expect("emit stayed blocked on a client that never reads");
        assert_eq!(remaining, 0);
    }

    #[cfg(unix)]
    #[test]
    fn bind_refuses_to_replace_a_regular_file() {
        let path = std::env::temp_dir()
            .join(format!("tossmeter-not-a-socket-{}.txt", std::process::id()));
        std::fs::write(&path, "keep me").unwrap();
        let err = SocketBroadcast::bind(&path).err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
        std::fs::remove_file(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn bind_replaces_a_stale_socket() {
        use std::os::unix::net::UnixListener;

        let path = std::env::temp_dir()
            .join(format!("tossmeter-stale-{}.sock", std::process::id()));
        // leave a socket file behind, as a crashed run would
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        let broadcast = SocketBroadcast::bind(&path).unwrap();
        assert_eq!(broadcast.client_count(), 0);
    }
}
