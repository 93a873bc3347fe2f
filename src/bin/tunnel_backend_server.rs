#![deny(warnings, rust_2018_idioms)]

use std::env;
use std::io::{Error, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use scgi_tunnel::backend;
use scgi_tunnel::target::TargetConn;

fn syntax() -> Error {
    println!(
        "Syntax: {} <scgi_listen_port> <target_local_port>",
        env::args().next().unwrap_or_default()
    );
    Error::new(ErrorKind::InvalidInput, "Expected two port arguments")
}

fn parse_port(arg: &str) -> Result<u16, Error> {
    match arg.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::new(
            ErrorKind::InvalidInput,
            format!("Invalid port '{}': expected an integer in [1, 65535]", arg),
        )),
    }
}

fn loopback_listener(port: u16) -> Result<TcpListener, Error> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
    socket.listen(16)
}

/// Resolves on SIGINT or SIGTERM. The backend observes this between SCGI sessions and exits
/// cleanly, closing the target connection.
async fn shutdown_signal() {
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        return Err(syntax());
    }
    let scgi_port = parse_port(&args[1])?;
    let target_port = parse_port(&args[2])?;

    let listener = loopback_listener(scgi_port)?;
    info!(scgi_port, target_port, "backend listening on 127.0.0.1");

    backend::run(listener, TargetConn::new(target_port), shutdown_signal()).await
}
