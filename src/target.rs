#![deny(warnings, rust_2018_idioms)]

use bytes::BytesMut;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Read chunk size for draining the target socket.
const READ_CHUNK: usize = 65536;

/// Owns the single long-lived TCP connection from the backend relay to the target service on
/// localhost. The connection is opened lazily on first use and reopened at most once per `send`
/// after a write failure. The target sees one continuous byte stream across the many SCGI
/// request/response turns the frontend generates.
#[derive(Debug)]
pub struct TargetConn {
    port: u16,
    stream: Option<TcpStream>,
}

impl TargetConn {
    /// Returns a connector for `127.0.0.1:<port>`. No connection is made until the first `send`
    /// or `drain`.
    pub fn new(port: u16) -> TargetConn {
        TargetConn { port, stream: None }
    }

    /// Connects to the target if no connection is currently open.
    async fn ensure_open(&mut self) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(("127.0.0.1", self.port)).await?;
            info!(port = self.port, "connected to target");
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().unwrap())
    }

    /// Writes all of `body` to the target. A single write failure is absorbed by closing,
    /// reconnecting, and re-sending the whole body; a second failure surfaces as the error.
    pub async fn send(&mut self, body: &[u8]) -> io::Result<()> {
        let stream = self.ensure_open().await?;
        if let Err(e) = stream.write_all(body).await {
            warn!(error = %e, "target write failed, reconnecting once");
            self.close();
            let stream = self.ensure_open().await?;
            stream.write_all(body).await?;
        }
        Ok(())
    }

    /// Non-blocking read of whatever the target has already emitted, up to `cap` bytes. Stops at
    /// would-block. A clean remote close releases the connection locally and keeps the bytes read
    /// so far; any other read error releases the connection and surfaces as the error. Returning
    /// an empty buffer is a normal outcome when the target is quiet.
    pub fn drain(&mut self, cap: usize) -> io::Result<BytesMut> {
        let mut out = BytesMut::new();
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(out),
        };
        let mut chunk = [0u8; READ_CHUNK];
        let mut release = false;
        let mut failure = None;
        while out.len() < cap {
            let want = READ_CHUNK.min(cap - out.len());
            match stream.try_read(&mut chunk[..want]) {
                Ok(0) => {
                    // Remote close. The next send will reconnect.
                    debug!("target closed its end, releasing connection");
                    release = true;
                    break;
                }
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "target read failed, releasing connection");
                    release = true;
                    failure = Some(e);
                    break;
                }
            }
        }
        if release {
            self.stream = None;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Drops any open connection. Also used on shutdown paths so release is deterministic.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("target connection closed");
        }
    }

    /// Reports whether a connection to the target is currently open.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
