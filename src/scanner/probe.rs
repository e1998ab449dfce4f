//! One probe, one socket.
//!
//! A probe connects, sends the handshake and status request, accumulates the
//! reply under a single deadline, and classifies what came back. Retries and
//! backoff live here too; the dispatcher only sees the final outcome.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use hickory_resolver::TokioAsyncResolver;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};
use tracing::trace;

use super::protocol;
use crate::processing::{self, EnrichedServer};

/// Reverse lookups get their own, shorter deadline so a slow resolver can
/// never hold a finished probe hostage.
const PTR_DEADLINE: Duration = Duration::from_millis(1500);

const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum ProbeOutcome {
    /// Connect failed, reset, or timed out with nothing usable.
    NoResponse { timed_out: bool },
    /// Bytes arrived but no status JSON could be located in them.
    Malformed,
    /// A parsed and enriched status response.
    Server(Box<EnrichedServer>),
}

#[derive(Debug)]
pub struct ProbeResult {
    pub addr: Ipv4Addr,
    pub outcome: ProbeOutcome,
    pub response_time: Duration,
    pub attempts: u32,
}

pub struct ProbeSettings {
    pub port: u16,
    pub timeout: Duration,
    pub max_retries: u32,
    pub framed_handshake: bool,
    /// None when geolocation is disabled.
    pub resolver: Option<Arc<TokioAsyncResolver>>,
}

enum Attempt {
    Status(serde_json::Value),
    Malformed,
    NoResponse { timed_out: bool },
}

/// Run the full retry chain against one address. Backoff between attempts
/// grows linearly; a malformed reply is final since asking again almost
/// never yields different bytes.
pub async fn probe_host(addr: Ipv4Addr, settings: Arc<ProbeSettings>) -> ProbeResult {
    let mut attempts = 0;
    let mut timed_out = false;

    while attempts < settings.max_retries.max(1) {
        let started = Instant::now();
        let attempt = attempt_status(addr, &settings).await;
        let response_time = started.elapsed();
        attempts += 1;

        match attempt {
            Attempt::Status(value) => {
                let status = processing::RawStatus::from_json(value);
                let hostname = match &settings.resolver {
                    Some(resolver) => resolve_ptr(resolver, addr).await,
                    None => None,
                };
                let server = processing::enrich(
                    addr,
                    settings.port,
                    &status,
                    response_time.as_millis() as u64,
                    hostname.as_deref(),
                );
                return ProbeResult {
                    addr,
                    outcome: ProbeOutcome::Server(Box::new(server)),
                    response_time,
                    attempts,
                };
            }
            Attempt::Malformed => {
                return ProbeResult {
                    addr,
                    outcome: ProbeOutcome::Malformed,
                    response_time,
                    attempts,
                };
            }
            Attempt::NoResponse { timed_out: t } => {
                timed_out = t;
                trace!("no response from {addr} (attempt {attempts})");
                sleep(Duration::from_millis(500 * attempts as u64)).await;
            }
        }
    }

    ProbeResult {
        addr,
        outcome: ProbeOutcome::NoResponse { timed_out },
        response_time: settings.timeout,
        attempts,
    }
}

async fn attempt_status(addr: Ipv4Addr, settings: &ProbeSettings) -> Attempt {
    let deadline = Instant::now() + settings.timeout;
    let target = SocketAddr::from((addr, settings.port));

    let mut stream = match timeout(settings.timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) => return Attempt::NoResponse { timed_out: false },
        Err(_) => return Attempt::NoResponse { timed_out: true },
    };

    let request = protocol::build_status_request(
        &addr.to_string(),
        settings.port,
        settings.framed_handshake,
    );
    if stream.write_all(&request).await.is_err() {
        return Attempt::NoResponse { timed_out: false };
    }

    // Accumulate until close, a complete frame, or the deadline. Whatever is
    // in the buffer by then gets its one shot at parsing.
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut hit_deadline = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            hit_deadline = true;
            break;
        }
        match timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if protocol::response_complete(&buf) || buf.len() > protocol::MAX_RESPONSE_BYTES {
                    break;
                }
            }
            Ok(Err(_)) => break,
            Err(_) => {
                hit_deadline = true;
                break;
            }
        }
    }

    match protocol::parse_status_response(&buf) {
        Ok(value) => Attempt::Status(value),
        Err(protocol::ResponseError::Empty) => Attempt::NoResponse {
            timed_out: hit_deadline,
        },
        Err(protocol::ResponseError::Malformed) => Attempt::Malformed,
    }
}

async fn resolve_ptr(resolver: &TokioAsyncResolver, addr: Ipv4Addr) -> Option<String> {
    let lookup = timeout(PTR_DEADLINE, resolver.reverse_lookup(IpAddr::V4(addr)))
        .await
        .ok()?
        .ok()?;
    lookup
        .iter()
        .next()
        .map(|name| name.to_string().trim_end_matches('.').to_string())
}
