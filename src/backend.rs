#![deny(warnings, rust_2018_idioms)]

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::io::{Error, ErrorKind};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::{first_header, SCGICodec, SCGIRequest, SCGIResponse};
use crate::target::TargetConn;

/// 10 MiB cap for request bodies.
pub const MAX_BODY: usize = 10 * 1024 * 1024;
/// 10 MiB cap for per-request readback from the target.
pub const MAX_RESP: usize = 10 * 1024 * 1024;

const STATUS_BAD_REQUEST: &str = "400 Bad Request";
const STATUS_PAYLOAD_TOO_LARGE: &str = "413 Payload Too Large";
const STATUS_BAD_GATEWAY: &str = "502 Bad Gateway";

/// Accepts and serves SCGI sessions strictly sequentially until `shutdown` resolves. Each session
/// carries one request; its body is forwarded to the target, then whatever the target has already
/// emitted is drained back as the response body. Request-local failures answer an error status and
/// never stop the loop; only an `accept` failure does. The shutdown future is observed between
/// sessions, so a request in flight always completes first.
pub async fn run<S>(listener: TcpListener, mut target: TargetConn, shutdown: S) -> Result<(), Error>
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let (conn, peer) = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            res = listener.accept() => res?,
        };
        match serve(conn, &mut target).await {
            Ok(()) => debug!(%peer, "served SCGI session"),
            Err(e) => warn!(%peer, error = %e, "failed to serve SCGI session"),
        }
    }
    info!("shutdown requested, closing target connection");
    target.close();
    Ok(())
}

/// Serves a single SCGI session: read one request, relay it, answer, close.
async fn serve(conn: TcpStream, target: &mut TargetConn) -> Result<(), Error> {
    let mut framed = Framed::new(conn, SCGICodec::new());
    let mut request = RequestState::new();

    loop {
        match framed.next().await {
            None => {
                // Client hung up before delivering the declared body. It may only have shut down
                // its write side, so still try to get the diagnostic out.
                framed
                    .send(SCGIResponse::error(
                        STATUS_BAD_REQUEST,
                        "Connection ended before a complete request arrived".to_string(),
                    ))
                    .await
                    .ok();
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "Client closed before request was complete",
                ));
            }
            Some(Err(e)) => {
                // InvalidData is the codec rejecting the netstring; answer 400. Anything else is
                // a socket-level failure with nobody left to answer.
                if e.kind() == ErrorKind::InvalidData {
                    return framed
                        .send(SCGIResponse::error(STATUS_BAD_REQUEST, e.to_string()))
                        .await;
                }
                return Err(e);
            }
            Some(Ok(frame)) => match request.advance(frame) {
                Err(response) => return framed.send(response).await,
                Ok(Step::NeedMore) => continue,
                Ok(Step::Complete(body)) => {
                    let response = relay(target, &body).await;
                    return framed.send(response).await;
                }
            },
        }
    }
}

/// Forwards the complete request body to the target, then drains whatever the target has already
/// emitted. Send-then-drain order is mandatory: bytes the target produced in response to an
/// earlier request surface on the earliest subsequent drain.
async fn relay(target: &mut TargetConn, body: &[u8]) -> SCGIResponse {
    if let Err(e) = target.send(body).await {
        return SCGIResponse::error(
            STATUS_BAD_GATEWAY,
            format!("Failed to forward request body to target: {}", e),
        );
    }
    match target.drain(MAX_RESP) {
        Ok(drained) => {
            debug!(
                forwarded = body.len(),
                drained = drained.len(),
                "relayed request"
            );
            SCGIResponse::ok(drained)
        }
        Err(e) => SCGIResponse::error(
            STATUS_BAD_GATEWAY,
            format!("Failed to read back from target: {}", e),
        ),
    }
}

enum Step {
    /// Body incomplete, keep reading frames.
    NeedMore,

    /// The full CONTENT_LENGTH body has arrived.
    Complete(BytesMut),
}

/// Per-request accumulation state: headers arrive in the leading frame, the body may trickle in
/// across any number of fragments.
struct RequestState {
    /// Accumulated body received so far.
    body: BytesMut,

    /// The amount of unconsumed body remaining, according to CONTENT_LENGTH.
    body_remaining: usize,

    validated: bool,
}

impl RequestState {
    fn new() -> RequestState {
        RequestState {
            body: BytesMut::new(),
            body_remaining: 0,
            validated: false,
        }
    }

    /// Folds one decoded frame into the request. Validation failures come back as ready-to-send
    /// error responses.
    fn advance(&mut self, frame: SCGIRequest) -> Result<Step, SCGIResponse> {
        match frame {
            SCGIRequest::Request(headers, body) => {
                let content_length = validate(&headers)?;
                self.validated = true;
                self.body_remaining = content_length;
                self.append(body);
                Ok(self.step())
            }
            SCGIRequest::BodyFragment(fragment) => {
                if !self.validated {
                    // The decoder only emits fragments after the leading Request frame.
                    return Err(SCGIResponse::error(
                        STATUS_BAD_REQUEST,
                        "Body bytes arrived before headers".to_string(),
                    ));
                }
                self.append(fragment);
                Ok(self.step())
            }
        }
    }

    /// Takes body bytes up to CONTENT_LENGTH; anything past it is dropped, the session closes
    /// after the response anyway.
    fn append(&mut self, bytes: BytesMut) {
        let take = self.body_remaining.min(bytes.len());
        self.body_remaining -= take;
        self.body.reserve(take);
        self.body.put(&bytes[..take]);
    }

    fn step(&mut self) -> Step {
        if self.body_remaining == 0 {
            Step::Complete(std::mem::take(&mut self.body))
        } else {
            Step::NeedMore
        }
    }
}

/// Checks the required SCGI headers and returns the declared body length. `SCGI` must equal `1`
/// and `CONTENT_LENGTH` must be a non-negative decimal no larger than `MAX_BODY`.
fn validate(headers: &[(String, String)]) -> Result<usize, SCGIResponse> {
    match first_header(headers, "SCGI") {
        Some("1") => {}
        Some(other) => {
            return Err(SCGIResponse::error(
                STATUS_BAD_REQUEST,
                format!("SCGI header must be '1', got '{}'", other),
            ))
        }
        None => {
            return Err(SCGIResponse::error(
                STATUS_BAD_REQUEST,
                "Missing SCGI header".to_string(),
            ))
        }
    }
    let raw = first_header(headers, "CONTENT_LENGTH").ok_or_else(|| {
        SCGIResponse::error(
            STATUS_BAD_REQUEST,
            "Missing CONTENT_LENGTH header".to_string(),
        )
    })?;
    let content_length: usize = raw.parse().map_err(|_| {
        SCGIResponse::error(
            STATUS_BAD_REQUEST,
            format!("CONTENT_LENGTH '{}' is not a non-negative integer", raw),
        )
    })?;
    if content_length > MAX_BODY {
        return Err(SCGIResponse::error(
            STATUS_PAYLOAD_TOO_LARGE,
            format!(
                "CONTENT_LENGTH {} exceeds maximum {} bytes",
                content_length, MAX_BODY
            ),
        ));
    }
    Ok(content_length)
}
