#![deny(warnings, rust_2018_idioms)]

use std::io::{Error, ErrorKind};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::exchange::HttpExchange;

/// Read buffer size for one tick's worth of client bytes.
const BUF_SIZE: usize = 65536;

/// Poll interval floor in seconds, restored whenever either side shows activity.
pub const DELAY_INITIAL: f64 = 0.1;
/// Poll interval ceiling in seconds, approached by doubling while idle.
pub const DELAY_MAX: f64 = 10.0;

/// The reset-on-activity, double-on-idle poll interval rule. Any bytes moved in either direction
/// restore the floor; a fully idle tick doubles the interval up to the ceiling.
pub fn next_delay(delay: f64, sent: usize, received: usize) -> f64 {
    if sent > 0 || received > 0 {
        DELAY_INITIAL
    } else {
        (delay * 2.0).min(DELAY_MAX)
    }
}

/// Accepts exactly one client connection and runs the tick loop until the session ends. Each tick
/// POSTs whatever the client had readable (possibly nothing) and writes the returned bytes back to
/// the client. The POST happens on every tick even when there is nothing to send, because the
/// exchange is the only way bytes queued on the far side ever come back.
///
/// Returns `Ok` however the session ends: client hangup, a client socket failure, and a failed
/// HTTP exchange all conclude the one session this process exists to serve. `Err` only surfaces
/// a failure of the initial accept.
pub async fn run(listener: TcpListener, exchange: HttpExchange) -> Result<(), Error> {
    let (mut conn, peer) = listener.accept().await?;
    // Single-client policy: close the listen socket, a fresh process handles the next session.
    drop(listener);
    info!(%peer, url = exchange.url(), "accepted tunnel client");

    let mut delay = DELAY_INITIAL;
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let mut send_len = 0;
        tokio::select! {
            res = conn.read(&mut buf) => match res {
                Ok(0) => {
                    info!("client closed its end, session complete");
                    return Ok(());
                }
                Ok(n) => send_len = n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "client read failed, session complete");
                    return Ok(());
                }
            },
            _ = time::sleep(Duration::from_secs_f64(delay)) => {}
        }

        let response = match exchange.post(buf[..send_len].to_vec()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "HTTP exchange failed, session complete");
                return Ok(());
            }
        };

        if !response.is_empty() {
            if let Err(e) = conn.write_all(&response).await {
                warn!(error = %e, "client write failed, session complete");
                return Ok(());
            }
        }
        delay = next_delay(delay, send_len, response.len());
        debug!(sent = send_len, received = response.len(), delay, "tick");
    }
}
