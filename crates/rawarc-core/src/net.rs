//! HTTP requester pool.
//!
//! Requesters are keyed by local bind address (any, IPv4-any, IPv6-any, or a
//! member of an IP pool) and reused across many requests. A requester can be
//! disposed to force a fresh transport; disposal never kills in-flight
//! response bodies. The transport cannot close new connections while
//! preserving existing ones, so the internal client counts open bodies and
//! only tears down once the last one is drained.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::Rng;

/// User agent sent with every request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                              (KHTML, like Gecko) Chrome/89.0.4389.90 Safari/537.36";

/// How many times a request is retried when it races a concurrent dispose.
const CLIENT_CLOSED_RETRIES: u32 = 3;

/// Address family selection when no explicit IP pool is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

/// Transport-level error surfaced to the download loop.
#[derive(Debug)]
pub enum NetError {
    /// The requester was disposed between lookup and use. Non-fatal; the
    /// request is retried against a freshly created client.
    ClientClosed,
    Transport(reqwest::Error),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::ClientClosed => write!(f, "client close requested"),
            NetError::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::ClientClosed => None,
            NetError::Transport(e) => Some(e),
        }
    }
}

/// Local addresses to spread requesters over, one line per address.
#[derive(Debug, Clone, Default)]
pub struct IpPool {
    addresses: Vec<IpAddr>,
}

impl IpPool {
    pub fn parse(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("unable to read IP pool file {}", path.display()))?;
        let mut addresses = Vec::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let ip: IpAddr = line
                .parse()
                .with_context(|| format!("invalid IP address '{line}' in pool file"))?;
            addresses.push(ip);
        }
        anyhow::ensure!(!addresses.is_empty(), "IP pool file {} is empty", path.display());
        Ok(IpPool { addresses })
    }

    fn random(&self) -> IpAddr {
        let idx = rand::thread_rng().gen_range(0..self.addresses.len());
        self.addresses[idx]
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    pub pool: Option<IpPool>,
    pub network: Network,
    pub use_quic: bool,
}

/// Pool of requesters keyed by bind address.
pub struct HttpClientPool {
    cfg: HttpClientConfig,
    requesters: Mutex<HashMap<Option<IpAddr>, Arc<Requester>>>,
}

impl HttpClientPool {
    pub fn new(cfg: HttpClientConfig) -> Arc<Self> {
        Arc::new(HttpClientPool {
            cfg,
            requesters: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the requester for a bind address chosen per configuration:
    /// a uniformly random pool member when an IP pool is set, otherwise the
    /// configured address family.
    pub fn get_requester(&self) -> Arc<Requester> {
        let bind = match &self.cfg.pool {
            Some(pool) => Some(pool.random()),
            None => match self.cfg.network {
                Network::Any => None,
                Network::Ipv4 => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                Network::Ipv6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            },
        };

        let mut requesters = self.requesters.lock().unwrap();
        Arc::clone(requesters.entry(bind).or_insert_with(|| {
            Arc::new(Requester {
                ip: bind,
                use_quic: self.cfg.use_quic,
                client: Mutex::new(None),
            })
        }))
    }
}

/// One reusable transport bound to a local address. `dispose` requests
/// teardown; the next request transparently builds a fresh transport.
pub struct Requester {
    ip: Option<IpAddr>,
    use_quic: bool,
    client: Mutex<Option<Arc<InternalClient>>>,
}

impl Requester {
    /// Requests teardown of the current transport. In-flight response bodies
    /// keep the transport alive until they are drained.
    pub fn dispose(&self) {
        if let Some(client) = self.client.lock().unwrap().take() {
            client.start_close();
        }
    }

    /// One HTTP GET round trip. Transparently recreates the transport after a
    /// dispose, retrying a bounded number of times if it races another one.
    pub async fn get(&self, url: &str) -> Result<TrackedResponse, NetError> {
        for _ in 0..CLIENT_CLOSED_RETRIES {
            let client = self.current_client()?;
            match InternalClient::get(&client, url).await {
                Err(NetError::ClientClosed) => continue,
                other => return other,
            }
        }
        Err(NetError::ClientClosed)
    }

    fn current_client(&self) -> Result<Arc<InternalClient>, NetError> {
        let mut slot = self.client.lock().unwrap();
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(InternalClient::build(self.ip, self.use_quic)?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }
}

struct CloseState {
    should_close: bool,
    pending_requests: u32,
}

/// Reference-counted wrapper around the transport client. `start_close`
/// defers the actual teardown until `pending_requests` reaches zero; the
/// final drop of the inner client releases its connections.
struct InternalClient {
    client: reqwest::Client,
    state: Mutex<CloseState>,
}

impl InternalClient {
    fn build(ip: Option<IpAddr>, use_quic: bool) -> Result<Self, NetError> {
        let builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .local_address(ip);
        #[cfg(feature = "http3")]
        let builder = if use_quic {
            builder.http3_prerelease()
        } else {
            builder
        };
        #[cfg(not(feature = "http3"))]
        let _ = use_quic;

        let client = builder.build().map_err(NetError::Transport)?;
        Ok(InternalClient {
            client,
            state: Mutex::new(CloseState {
                should_close: false,
                pending_requests: 0,
            }),
        })
    }

    fn start_close(&self) {
        let mut state = self.state.lock().unwrap();
        state.should_close = true;
        // with pending_requests == 0 the final Arc drop releases the
        // transport; otherwise the last end_request does
    }

    fn start_request(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.should_close {
            return false;
        }
        state.pending_requests += 1;
        true
    }

    fn end_request(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending_requests -= 1;
    }

    async fn get(client: &Arc<Self>, url: &str) -> Result<TrackedResponse, NetError> {
        if !client.start_request() {
            return Err(NetError::ClientClosed);
        }
        let guard = RequestGuard {
            client: Arc::clone(client),
        };
        match client.client.get(url).send().await {
            Ok(response) => Ok(TrackedResponse {
                response,
                _guard: guard,
            }),
            Err(e) => Err(NetError::Transport(e)),
        }
    }
}

/// Decrements the open-body count when the response is dropped, which is what
/// lets a disposed client finally tear down.
struct RequestGuard {
    client: Arc<InternalClient>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.client.end_request();
    }
}

/// A response whose body keeps the originating transport alive until dropped.
pub struct TrackedResponse {
    response: reqwest::Response,
    _guard: RequestGuard,
}

impl TrackedResponse {
    pub fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response.headers().get(name)?.to_str().ok()
    }

    /// Next body chunk, or `None` at end of stream.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        self.response.chunk().await.map_err(NetError::Transport)
    }

    /// Reads the body to completion and throws it away.
    pub async fn discard(mut self) {
        while let Ok(Some(_)) = self.chunk().await {}
    }
}
