pub mod handler;
pub mod protocol;
pub mod session;

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use tokio::net::{TcpListener, UnixListener};

/// Remote peer description attached to every connection, usable for both
/// TCP and UNIX-socket listeners.
#[derive(Debug, Clone)]
pub struct ClientAddr(pub String);

impl Connected<IncomingStream<'_, TcpListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        ClientAddr(stream.remote_addr().to_string())
    }
}

impl Connected<IncomingStream<'_, UnixListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, UnixListener>) -> Self {
        ClientAddr(format!("{:?}", stream.remote_addr()))
    }
}
