//! Minimal HTTP/1.1 server with per-segment failure injection.
//!
//! Serves query-shape segment URLs: the `sq` query parameter addresses the
//! segment, every successful response carries `x-head-seqnum` with the total,
//! and requests without `sq` (the speculative base-URL hit) are counted
//! separately. Failure plans can make a segment answer 503 a number of times
//! or drop the connection before responding.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone, Copy, Default)]
pub struct FailPlan {
    /// Answer 503 this many times before succeeding.
    pub non200: usize,
    /// Drop the connection without a response this many times.
    pub drop_conn: usize,
    /// Never succeed (always 503).
    pub always_fail: bool,
}

struct State {
    total: usize,
    plans: Mutex<HashMap<usize, FailPlan>>,
    hits: Mutex<HashMap<usize, usize>>,
    base_hits: Mutex<usize>,
}

pub struct SegmentServer {
    port: u16,
    state: Arc<State>,
}

impl SegmentServer {
    /// Starts a server for `total` segments in a background thread. It runs
    /// until the process exits.
    pub fn start(total: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State {
            total,
            plans: Mutex::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
            base_hits: Mutex::new(0),
        });

        let server_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let state = Arc::clone(&server_state);
                thread::spawn(move || handle(stream, &state));
            }
        });

        SegmentServer { port, state }
    }

    /// A query-shape segment URL for this server.
    pub fn url(&self) -> String {
        format!(
            "http://127.0.0.1:{}/videoplayback?noclen=1&id=testid&itag=140&expire=9999999999",
            self.port
        )
    }

    pub fn fail_segment(&self, segment: usize, plan: FailPlan) {
        self.state.plans.lock().unwrap().insert(segment, plan);
    }

    /// Requests seen for `segment`, including failed ones.
    pub fn hits(&self, segment: usize) -> usize {
        *self.state.hits.lock().unwrap().get(&segment).unwrap_or(&0)
    }

    /// Requests without an `sq` parameter.
    pub fn base_hits(&self) -> usize {
        *self.state.base_hits.lock().unwrap()
    }

    /// The body served for `segment`.
    pub fn body_for(segment: usize) -> Vec<u8> {
        format!("segment-{segment:08}-payload|").into_bytes()
    }
}

fn handle(mut stream: TcpStream, state: &State) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(2)));

    // GET requests only; read until the end of the headers
    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return,
        }
        if buf.len() > 65536 {
            return;
        }
    }
    let Ok(request) = std::str::from_utf8(&buf) else {
        return;
    };
    let Some(query) = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|target| target.split_once('?').map(|(_, q)| q).unwrap_or(""))
    else {
        return;
    };

    let segment = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("sq="))
        .and_then(|v| v.parse::<usize>().ok());

    let Some(segment) = segment else {
        *state.base_hits.lock().unwrap() += 1;
        respond(&mut stream, "200 OK", state.total, b"ok");
        return;
    };

    *state.hits.lock().unwrap().entry(segment).or_insert(0) += 1;

    {
        let mut plans = state.plans.lock().unwrap();
        if let Some(plan) = plans.get_mut(&segment) {
            if plan.drop_conn > 0 {
                plan.drop_conn -= 1;
                // close without answering: transport-level failure
                return;
            }
            if plan.always_fail {
                respond(&mut stream, "503 Service Unavailable", state.total, b"");
                return;
            }
            if plan.non200 > 0 {
                plan.non200 -= 1;
                respond(&mut stream, "503 Service Unavailable", state.total, b"");
                return;
            }
        }
    }

    let body = SegmentServer::body_for(segment);
    respond(&mut stream, "200 OK", state.total, &body);
}

fn respond(stream: &mut TcpStream, status: &str, total: usize, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 {status}\r\nx-head-seqnum: {total}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(body);
}
