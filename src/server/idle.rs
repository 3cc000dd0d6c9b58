//! Idle connection timeout
//!
//! hyper has no idle timeout of its own, so connections are wrapped in
//! [`IdleTimeoutStream`], which fails the pending read or write once no bytes
//! have moved in either direction for the configured duration. hyper then
//! drops the connection.

use crate::logging::Logger;
use axum_server::accept::Accept;
use std::future::{ready, Future, Ready};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant, Sleep};

/// Stream that errors after `timeout` without any I/O
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    peer: Option<SocketAddr>,
    error_log: Option<Arc<dyn Logger>>,
}

impl<S> IdleTimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(sleep(timeout)),
            peer: None,
            error_log: None,
        }
    }

    /// Report idle closures of the connection from `peer` to `error_log`
    pub fn with_error_log(mut self, peer: Option<SocketAddr>, error_log: Arc<dyn Logger>) -> Self {
        self.peer = peer;
        self.error_log = Some(error_log);
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn touch(&mut self) {
        let next = Instant::now() + self.timeout;
        self.deadline.as_mut().reset(next);
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if self.deadline.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        if let Some(log) = &self.error_log {
            let peer = self
                .peer
                .map(|p| p.to_string())
                .unwrap_or_else(|| String::from("unknown peer"));
            log.error(&format!(
                "[healthz-server] closing connection from {} idle for {:?}",
                peer, self.timeout
            ));
        }
        Poll::Ready(io::Error::new(
            io::ErrorKind::TimedOut,
            "connection idle timeout",
        ))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_expired(cx).map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_expired(cx).map(Err),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_expired(cx).map(Err),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// `axum-server` acceptor wrapping every accepted connection in an
/// [`IdleTimeoutStream`]
#[derive(Clone)]
pub struct IdleTimeoutAcceptor {
    timeout: Duration,
    error_log: Arc<dyn Logger>,
}

impl IdleTimeoutAcceptor {
    pub fn new(timeout: Duration, error_log: Arc<dyn Logger>) -> Self {
        Self { timeout, error_log }
    }
}

impl<S> Accept<TcpStream, S> for IdleTimeoutAcceptor {
    type Stream = IdleTimeoutStream<TcpStream>;
    type Service = S;
    type Future = Ready<io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: TcpStream, service: S) -> Self::Future {
        let peer = stream.peer_addr().ok();
        let stream = IdleTimeoutStream::new(stream, self.timeout)
            .with_error_log(peer, Arc::clone(&self.error_log));
        ready(Ok((stream, service)))
    }
}
