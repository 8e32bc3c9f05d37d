//! Cancellable stream transport
//!
//! Stream requests run on a small dedicated tokio runtime and are driven from
//! the engine's plain threads with `block_on`. Every wait is raced against a
//! `CancellationToken`. Cancelling drops the in-flight request or body, which
//! closes its socket, so a stalled server can never pin a thread or a
//! connection.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::network::{MAX_CHALLENGE_HEAD, NET_WORKER_THREADS};
use crate::error::{friendly_network_error, RadioError, Result};
use crate::routing::client::{build_client, connect_timeout, digest_proxy};
use crate::routing::digest::client_nonce;
use crate::routing::{ClientPurpose, CustomProxy, DigestChallenge, EffectiveRoute, ProxyProtocol};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The runtime stream connections run on, started on first use
pub fn runtime() -> io::Result<&'static Runtime> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = Builder::new_multi_thread()
        .worker_threads(NET_WORKER_THREADS)
        .thread_name("umbra-net")
        .enable_all()
        .build()?;
    // If another thread got here first, its runtime wins and this one is dropped
    Ok(RUNTIME.get_or_init(|| rt))
}

/// Network bytes received. Clones share one count.
#[derive(Debug, Clone, Default)]
pub struct TrafficMeter {
    bytes: Arc<AtomicU64>,
}

impl TrafficMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// GET `url` over `route`. Blocks until the response head arrives, the
/// request fails, or `cancel` fires (`Ok(None)`).
///
/// Custom proxies set up for Digest authentication get their challenge
/// answered here.
pub fn open_stream(
    route: &EffectiveRoute,
    purpose: ClientPurpose,
    url: &str,
    headers: &[(&'static str, &'static str)],
    cancel: &CancellationToken,
) -> Result<Option<Response>> {
    if cancel.is_cancelled() {
        return Ok(None);
    }
    let rt = runtime()?;
    rt.block_on(async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            result = send_request(route, purpose, url, headers) => result.map(Some),
        }
    })
}

fn get(client: &Client, url: &str, headers: &[(&'static str, &'static str)]) -> RequestBuilder {
    headers
        .iter()
        .fold(client.get(url), |request, (name, value)| request.header(*name, *value))
}

async fn send_request(
    route: &EffectiveRoute,
    purpose: ClientPurpose,
    url: &str,
    headers: &[(&'static str, &'static str)],
) -> Result<Response> {
    let Some(proxy) = digest_proxy(route) else {
        let client = build_client(route, purpose, None)?;
        return Ok(get(&client, url, headers).send().await?);
    };

    let parsed = Url::parse(url).map_err(|e| RadioError::Stream(format!("Invalid URL {url}: {e}")))?;

    if parsed.scheme() == "https" {
        // The challenge arrives on the CONNECT, which reqwest keeps to itself,
        // so fetch it first and present the answer on the real tunnel.
        let authority = format!(
            "{}:{}",
            parsed.host_str().unwrap_or_default(),
            parsed.port_or_known_default().unwrap_or(443)
        );
        let auth = match proxy.protocol {
            ProxyProtocol::Http => connect_challenge(proxy, &authority, connect_timeout(route))
                .await
                .map(|challenge| {
                    debug!(realm = challenge.realm(), "Answering digest proxy challenge for CONNECT");
                    challenge.authorization(
                        &proxy.username,
                        &proxy.password,
                        "CONNECT",
                        &authority,
                        &client_nonce(),
                    )
                })
                .and_then(|value| HeaderValue::from_str(&value).ok()),
            _ => None,
        };
        let client = build_client(route, purpose, auth)?;
        return Ok(get(&client, url, headers).send().await?);
    }

    let client = build_client(route, purpose, None)?;
    let response = get(&client, url, headers).send().await?;
    if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Ok(response);
    }
    let challenge = DigestChallenge::find(
        response
            .headers()
            .get_all(PROXY_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    );
    let Some(challenge) = challenge else {
        return Ok(response);
    };
    drop(response);

    debug!(realm = challenge.realm(), "Answering digest proxy challenge");
    let auth = challenge.authorization(
        &proxy.username,
        &proxy.password,
        "GET",
        parsed.path(),
        &client_nonce(),
    );
    Ok(get(&client, url, headers)
        .header(PROXY_AUTHORIZATION, auth)
        .send()
        .await?)
}

/// Ask the proxy for a tunnel without credentials and return its Digest
/// challenge, if it sends one
async fn connect_challenge(
    proxy: &CustomProxy,
    authority: &str,
    timeout: Duration,
) -> Option<DigestChallenge> {
    let exchange = async {
        let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await.ok()?;
        let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
        stream.write_all(request.as_bytes()).await.ok()?;

        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_CHALLENGE_HEAD {
            let n = stream.read(&mut buf).await.ok()?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        Some(String::from_utf8_lossy(&head).into_owned())
    };

    let head = tokio::time::timeout(timeout, exchange).await.ok().flatten()?;
    challenge_in_head(&head)
}

fn challenge_in_head(head: &str) -> Option<DigestChallenge> {
    let mut lines = head.split("\r\n");
    let status = lines.next()?;
    if status.split_whitespace().nth(1) != Some("407") {
        return None;
    }
    DigestChallenge::find(lines.filter_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("proxy-authenticate")
            .then_some(value.trim())
    }))
}

/// Blocking `Read` over a streaming response body.
///
/// Each read waits for the next network chunk or for `cancel`. On cancel,
/// end of stream or error the response is dropped, closing the connection.
pub struct HttpBody {
    response: Option<Response>,
    pending: Vec<u8>,
    pos: usize,
    cancel: CancellationToken,
    meter: TrafficMeter,
    received: u64,
}

impl HttpBody {
    pub fn new(response: Response, cancel: CancellationToken, meter: TrafficMeter) -> Self {
        Self {
            response: Some(response),
            pending: Vec::new(),
            pos: 0,
            cancel,
            meter,
            received: 0,
        }
    }

    /// Bytes received on this connection
    pub fn received(&self) -> u64 {
        self.received
    }

    fn close(&mut self) {
        if self.response.take().is_some() {
            debug!(bytes = self.received, "Stream connection closed");
        }
    }
}

impl Read for HttpBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            if self.cancel.is_cancelled() {
                self.close();
                return Ok(0);
            }
            let Some(response) = self.response.as_mut() else {
                return Ok(0);
            };
            let cancel = &self.cancel;
            let next = runtime()?.block_on(async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    chunk = response.chunk() => Some(chunk),
                }
            });

            match next {
                None | Some(Ok(None)) => {
                    self.close();
                    return Ok(0);
                }
                Some(Ok(Some(chunk))) => {
                    self.meter.record(chunk.len() as u64);
                    self.received += chunk.len() as u64;
                    self.pending.clear();
                    self.pending.extend_from_slice(&chunk);
                    self.pos = 0;
                }
                Some(Err(e)) => {
                    self.close();
                    return Err(io::Error::other(friendly_network_error(&e)));
                }
            }
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for HttpBody {
    fn drop(&mut self) {
        self.close();
    }
}
