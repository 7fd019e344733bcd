//! Shared test helpers for iosrig-core integration tests.
//!
//! Provides a scripted HTTP status endpoint and stub commands that stand in
//! for Appium, `xcodebuild` and `iproxy`.

#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use iosrig_core::orchestrator::ServiceTimeouts;
use iosrig_core::ports::PortPlan;

// ---------------------------------------------------------------------------
// Stub status server
// ---------------------------------------------------------------------------

/// HTTP server that answers the n-th request with the n-th scripted status.
///
/// Once the script is exhausted the last status repeats. Every request counts
/// as a hit regardless of path.
pub struct StubStatusServer {
    port: u16,
    hits: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl StubStatusServer {
    pub fn start(statuses: Vec<u16>) -> Self {
        assert!(!statuses.is_empty(), "script needs at least one status");
        let listener = bind_below(PortPlan::MAX_BASE);
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (thread_hits, thread_shutdown) = (Arc::clone(&hits), Arc::clone(&shutdown));

        thread::spawn(move || {
            while !thread_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let n = thread_hits.fetch_add(1, Ordering::SeqCst);
                        let status = statuses[n.min(statuses.len() - 1)];
                        let _ = respond(stream, status);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            port,
            hits,
            shutdown,
        }
    }

    /// Always answer 200.
    pub fn healthy() -> Self {
        Self::start(vec![200])
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for StubStatusServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Bind an ephemeral port that can serve as an Appium base port.
fn bind_below(max: u16) -> TcpListener {
    for _ in 0..50 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        if listener.local_addr().unwrap().port() <= max {
            return listener;
        }
    }
    panic!("no ephemeral port at or below {max}");
}

fn respond(stream: TcpStream, status: u16) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    while reader.read_line(&mut line)? > 2 {
        line.clear();
    }

    let body = if status == 200 {
        r#"{"value":{"ready":true}}"#
    } else {
        r#"{"value":{"ready":false}}"#
    };
    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {status} Stub\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()
}

// ---------------------------------------------------------------------------
// Stub commands
// ---------------------------------------------------------------------------

/// A command prefix that stays alive and ignores whatever arguments the
/// orchestrator appends. They land in `$0..` of the shell.
pub fn long_running(role: &str) -> Vec<String> {
    vec![
        "sh".into(),
        "-c".into(),
        "exec sleep 30".into(),
        role.into(),
    ]
}

/// A command prefix that exits immediately with status 3.
pub fn exits_immediately(role: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), "exit 3".into(), role.into()]
}

/// Fast timeouts so failing tests do not hang for minutes.
pub fn fast_timeouts(readiness: Duration) -> ServiceTimeouts {
    ServiceTimeouts {
        readiness_timeout: readiness,
        poll_interval: Duration::from_millis(50),
        graceful_stop: Duration::from_secs(2),
        forceful_stop: Duration::from_secs(2),
    }
}
