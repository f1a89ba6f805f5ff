//! Byte stream over plain TCP or TLS, used on both sides of the proxy.

use pin_project_lite::pin_project;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pin_project! {
    #[project = StreamInnerProj]
    #[derive(Debug)]
    pub enum StreamInner {
        Plain {
            #[pin]
            stream: TcpStream,
        },
        Tls {
            #[pin]
            stream: tokio_native_tls::TlsStream<TcpStream>,
        },
    }
}

impl StreamInner {
    pub fn plain(stream: TcpStream) -> Self {
        StreamInner::Plain { stream }
    }

    pub fn tls(stream: tokio_native_tls::TlsStream<TcpStream>) -> Self {
        StreamInner::Tls { stream }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            StreamInner::Plain { stream } => stream.peer_addr(),
            StreamInner::Tls { stream } => stream.get_ref().get_ref().get_ref().peer_addr(),
        }
    }
}

impl AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.project() {
            StreamInnerProj::Plain { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::Plain { stream } => stream.poll_flush(cx),
            StreamInnerProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::Plain { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

impl AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            StreamInnerProj::Plain { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}
