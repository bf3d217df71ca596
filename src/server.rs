//! The gateway's HTTP loop and route dispatch.
//!
//! Built directly on hyper's HTTP/1.1 connection handling with upgrade
//! support; each accepted connection gets its own task. The route table is
//! fixed, so dispatch is an explicit match rather than a generic router:
//! `/session` upgrades to the WebSocket session channel, `/audio/{hex}`
//! serves cached blobs (single-range requests honored),
//! `/models/{slug}/dead-letters` exposes retained failures, and `/healthz`
//! reports queue depths and cache size.

use std::convert::Infallible;
use std::sync::Arc;

use http::{Method, StatusCode, header};
use hyper::body::Incoming;
use hyper::{server::conn::http1, service::service_fn};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::body::Body;
use crate::cache::AudioCache;
use crate::config::GatewayConfig;
use crate::fingerprint::Fingerprint;
use crate::session::{SessionChannel, SessionIdentity};
use crate::substrate::Substrate;
use crate::ws;

pub type Request = hyper::Request<Incoming>;
pub type Response = hyper::Response<Body>;

/// Everything request handling needs, shared across connections.
pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub substrate: Arc<Substrate>,
    pub cache: Arc<AudioCache>,
    pub sessions: Arc<SessionChannel>,
}

/// Accepts connections and serves them until the listener fails.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "gateway listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let gateway = gateway.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req: Request| {
                let gateway = gateway.clone();
                async move { Ok::<_, Infallible>(gateway.dispatch(req).await) }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            // Upgrades carry the session-channel WebSockets.
            let conn = http.serve_connection(io, svc).with_upgrades();

            if let Err(err) = conn.await {
                debug!(%addr, %err, "connection closed with error");
            }
        });
    }
}

impl Gateway {
    pub async fn dispatch(self: Arc<Self>, req: Request) -> Response {
        if req.method() != Method::GET {
            return status_response(StatusCode::METHOD_NOT_ALLOWED, "only GET is served");
        }
        let path = req.uri().path().to_string();

        if path == "/healthz" {
            return self.healthz();
        }
        if path == "/session" {
            let identity = SessionIdentity::from_query(req.uri().query());
            let sessions = self.sessions.clone();
            return ws::upgrade(req, move |socket| sessions.handle(socket, identity));
        }
        if let Some(hex) = path.strip_prefix("/audio/") {
            let range = req
                .headers()
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return self.serve_audio(hex, range.as_deref()).await;
        }
        if let Some(slug) = path
            .strip_prefix("/models/")
            .and_then(|rest| rest.strip_suffix("/dead-letters"))
        {
            return json_response(StatusCode::OK, &self.substrate.dead_letters(slug));
        }

        status_response(StatusCode::NOT_FOUND, "not found")
    }

    fn healthz(&self) -> Response {
        let queues: serde_json::Map<String, serde_json::Value> = self
            .config
            .models
            .iter()
            .map(|m| (m.slug.clone(), json!(self.substrate.queue_depth(&m.slug))))
            .collect();
        json_response(
            StatusCode::OK,
            &json!({
                "queues": queues,
                "inflight": self.substrate.inflight_len(),
                "cache": { "entries": self.cache.len(), "bytes": self.cache.total() },
            }),
        )
    }

    async fn serve_audio(&self, hex: &str, range: Option<&str>) -> Response {
        let Some(fingerprint) = Fingerprint::parse_hex(hex) else {
            return status_response(StatusCode::NOT_FOUND, "not found");
        };
        let (bytes, meta) = match self.cache.get(fingerprint).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return status_response(StatusCode::NOT_FOUND, "not found"),
            Err(err) => {
                error!(%fingerprint, %err, "audio cache read failed");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR, "cache read failed");
            }
        };

        let total = bytes.len() as u64;
        if let Some((start, end)) = range.and_then(|spec| parse_range(spec, total)) {
            let slice = bytes.slice(start as usize..=end as usize);
            return hyper::Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, meta.codec)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
                .body(Body::from(slice))
                .unwrap();
        }

        hyper::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, meta.codec)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from(bytes))
            .unwrap()
    }
}

/// Parses a single-range `Range` header into inclusive byte offsets.
/// Multi-range and unsatisfiable specs come back as `None`, which serves
/// the full body instead.
fn parse_range(spec: &str, len: u64) -> Option<(u64, u64)> {
    let spec = spec.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || len == 0 {
            return None;
        }
        return Some((len.saturating_sub(suffix), len - 1));
    }
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() { len.checked_sub(1)? } else { end.parse().ok()? };
    if start > end || end >= len {
        return None;
    }
    Some((start, end))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    hyper::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn status_response(status: StatusCode, message: &'static str) -> Response {
    hyper::Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing_covers_the_forms() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(parse_range("bytes=10-", 100), Some((10, 99)));
        assert_eq!(parse_range("bytes=-10", 100), Some((90, 99)));
        assert_eq!(parse_range("bytes=0-99", 100), Some((0, 99)));
    }

    #[test]
    fn bad_ranges_fall_back_to_full_body() {
        assert_eq!(parse_range("bytes=50-40", 100), None);
        assert_eq!(parse_range("bytes=0-100", 100), None);
        assert_eq!(parse_range("bytes=0-9,20-29", 100), None);
        assert_eq!(parse_range("items=0-9", 100), None);
        assert_eq!(parse_range("bytes=-0", 100), None);
        assert_eq!(parse_range("bytes=0-", 0), None);
    }
}
