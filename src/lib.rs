#![deny(warnings)]

//! TCP-over-HTTP tunnel relays for Tokio.
//!
//! This crate provides the two ends of a tunnel that carries a raw bidirectional TCP byte stream
//! across an HTTP boundary. The frontend relay accepts one local TCP client and turns its stream
//! into a sequence of HTTP POST exchanges with adaptive polling. The backend relay sits behind an
//! HTTP-to-SCGI gateway (NGINX and Apache both speak SCGI out of the box), keeps one persistent
//! TCP connection to a local target service, and answers each exchange with whatever the target
//! has emitted so far. Together they give a TCP-like conduit between a client that can only reach
//! the world through an HTTP-accepting gateway and a service on the gateway's side.
//! The `tunnel_backend_server` and `tunnel_frontend_server` binaries wire the relays to the
//! command line.

/// Codec for the backend relay's SCGI listener: parses netstring-framed SCGI requests and writes
/// CGI-style responses.
pub mod codec;

/// The backend relay: serial SCGI sessions relayed onto the persistent target connection.
pub mod backend;

/// The persistent connection to the target service, with blocking-write and non-blocking-drain
/// primitives.
pub mod target;

/// One blocking HTTP POST exchange per frontend tick.
pub mod exchange;

/// The frontend relay: one client connection multiplexed against an adaptive poll timer.
pub mod frontend;
