#![deny(warnings, rust_2018_idioms)]

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::io::{Error, ErrorKind};
use tracing::debug;

/// One HTTP POST exchange per frontend tick: pushes the bytes read from the local client and
/// pulls whatever the backend drained from the target. The `reqwest::Client` is built once and
/// reused for every tick, keeping the hop connection warm.
#[derive(Debug)]
pub struct HttpExchange {
    client: Client,
    url: String,
}

impl HttpExchange {
    /// Returns an exchange bound to `url`. No per-request timeout is configured: the frontend's
    /// poll interval is its only timer.
    pub fn new(url: String) -> Result<HttpExchange, Error> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpExchange { client, url })
    }

    /// POSTs `body` (possibly empty, still a POST with Content-Length 0) and returns the full
    /// response body. Transport errors and any status other than 200 surface as errors; the
    /// caller ends its session on either. reqwest never emits `Expect: 100-continue`, so there
    /// is nothing to suppress.
    pub async fn post(&self, body: Vec<u8>) -> Result<Bytes, Error> {
        let sent = body.len();
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::other(format!("HTTP exchange failed: {}", e)))?;
        if response.status() != StatusCode::OK {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("HTTP exchange returned status {}", response.status()),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::other(format!("Failed to read HTTP response body: {}", e)))?;
        debug!(sent, received = bytes.len(), "exchange complete");
        Ok(bytes)
    }

    /// The URL each tick POSTs to.
    pub fn url(&self) -> &str {
        &self.url
    }
}
