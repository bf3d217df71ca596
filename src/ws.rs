//! WebSocket upgrade for session channels.
//!
//! Performs the RFC 6455 handshake on a hyper request and hands the
//! upgraded connection to the session handler as a `WebSocketStream`. The
//! handler runs in its own task; handshake failures come back as plain
//! HTTP error responses.

use std::future::Future;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::{StatusCode, header};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};
use tracing::debug;

use crate::body::Body;

/// Upgrades a request to a WebSocket and spawns `handler` on the stream.
///
/// Returns the `101 Switching Protocols` response to send back, or a
/// `400 Bad Request` when the upgrade headers are missing.
pub fn upgrade<H, Fut>(req: hyper::Request<Incoming>, handler: H) -> hyper::Response<Body>
where
    H: FnOnce(WebSocketStream<TokioIo<Upgraded>>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Some(key) = req.headers().get("Sec-WebSocket-Key") else {
        return hyper::Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Body::from("missing Sec-WebSocket-Key"))
            .unwrap();
    };

    // RFC 6455 accept hash.
    let accept = {
        let mut sha1 = Sha1::new();
        sha1.update(key.as_bytes());
        sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
        STANDARD.encode(sha1.finalize())
    };

    let response = hyper::Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept)
        .body(Body::empty())
        .unwrap();

    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                handler(ws).await;
            }
            Err(err) => debug!(%err, "websocket upgrade failed"),
        }
    });

    response
}
