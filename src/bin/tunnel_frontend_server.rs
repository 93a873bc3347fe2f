#![deny(warnings, rust_2018_idioms)]

use std::env;
use std::io::{Error, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpSocket};
use tracing::info;
use tracing_subscriber::EnvFilter;

use scgi_tunnel::exchange::HttpExchange;
use scgi_tunnel::frontend;

fn syntax() -> Error {
    println!(
        "Syntax: {} <listen_port> <url>",
        env::args().next().unwrap_or_default()
    );
    Error::new(ErrorKind::InvalidInput, "Expected a port and a URL argument")
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
    // One client per process lifetime; no need for a deep backlog.
    socket.listen(1)
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
    let url = args[2].clone();
    if url.starts_with('-') {
        // Probably a commandline argument like '-h'/'--help', avoid treating it as a URL
        return Err(syntax());
    }
    let listen_port = parse_port(&args[1])?;

    let listener = loopback_listener(listen_port)?;
    info!(listen_port, url, "frontend listening on 127.0.0.1");

    frontend::run(listener, HttpExchange::new(url)?).await
}
