// tests/common/mod.rs

//! Shared test utilities for integration tests.
//!
//! `TestServer` is a minimal loopback HTTP server with programmable
//! routes, so fetch and redistribution behavior can be exercised without
//! touching the network.

use rootforge::{BuildEngine, CoreConfig};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Route engine/fetch tracing through the test harness's capture.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .try_init();
    });
}

/// A programmable loopback HTTP server.
pub struct TestServer {
    addr: String,
    routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>>,
    hits: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    /// Start a server on an ephemeral port.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let hits: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let thread_routes = Arc::clone(&routes);
        let thread_hits = Arc::clone(&hits);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let routes = Arc::clone(&thread_routes);
                let hits = Arc::clone(&thread_hits);
                std::thread::spawn(move || handle_connection(stream, routes, hits));
            }
        });

        Self { addr, routes, hits }
    }

    /// The server's base URL, e.g. `http://127.0.0.1:41234`.
    pub fn base_url(&self) -> &str {
        &self.addr
    }

    /// Serve `body` with status 200 at `path`.
    pub fn route(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.route_status(path, 200, body);
    }

    /// Serve `body` with an explicit status at `path`.
    pub fn route_status(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.into()));
    }

    /// Number of requests made to `path`.
    pub fn hit_count(&self, path: &str) -> usize {
        self.hits.lock().unwrap().iter().filter(|p| *p == path).count()
    }
}

fn handle_connection(
    stream: TcpStream,
    routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>>,
    hits: Arc<Mutex<Vec<String>>>,
) {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    // Drain headers.
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) if line == "\r\n" || line == "\n" => break,
            Ok(_) => continue,
            Err(_) => return,
        }
    }

    hits.lock().unwrap().push(path.clone());

    let response = routes.lock().unwrap().get(&path).cloned();
    let mut stream = reader.into_inner();

    match response {
        Some((status, body)) => {
            let reason = match status {
                200 => "OK",
                404 => "Not Found",
                _ => "Error",
            };
            let header = format!(
                "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                reason,
                body.len()
            );
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(&body);
        }
        None => {
            let _ = stream.write_all(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
    }
    let _ = stream.flush();
}

/// An engine over a fresh temporary store.
///
/// Keep the `TempDir` alive for the duration of the test.
pub fn test_engine() -> (TempDir, BuildEngine) {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let engine =
        BuildEngine::new(CoreConfig::new(dir.path().join("build"))).expect("create engine");
    (dir, engine)
}

/// Read an entire artifact produced by a build.
#[allow(dead_code)]
pub fn read_all(mut reader: impl Read) -> Vec<u8> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).expect("read artifact");
    bytes
}
