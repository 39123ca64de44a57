//! How a client reaches its card server.

use std::io;
use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream to a card server.
pub trait ServerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ServerStream for T {}

/// Boxed server stream.
pub type BoxedStream = Box<dyn ServerStream>;

/// Opens connections to card servers.
pub trait Connector: Send + Sync + 'static {
    /// Connect to `host:port`, giving up after `timeout`.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {}:{} timed out", host, port),
                    ))
                }
            };
            stream.set_nodelay(true)?;
            debug!("TCP connection established to {}:{}", host, port);
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
