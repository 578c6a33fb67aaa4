//! Connection sources for the daemon's accept loop.
//!
//! A [`Listener`] is a (possibly finite) source of byte streams to serve
//! NBD over. TCP sockets accept forever; the channel-fed [`StreamListener`]
//! used by tests is exhausted once its sender is dropped, which is how test
//! daemons wind down without a signal.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A source of incoming connections.
///
/// `accept` returns `None` once the source is exhausted; the accept loop
/// treats that as a clean shutdown. A failed accept is an `Err` item, not
/// the end of the source.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> Option<io::Result<Self::Stream>>;
}

/// TCP sockets never run out; `accept` always yields.
#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> Option<io::Result<Self::Stream>> {
        Some(TcpListener::accept(self).await.map(|(stream, _addr)| stream))
    }
}

/// A listener fed streams through a channel.
///
/// Lets tests drive the full accept/handshake/transmission path over
/// `tokio::io::duplex` pairs without binding sockets.
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
}

impl<S> StreamListener<S> {
    /// Create a stream listener with the given channel capacity, returning
    /// the sender half for pushing connections.
    pub fn new(buffer: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> Option<io::Result<Self::Stream>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn accepts_streams_in_order() {
        let (tx, mut listener) = StreamListener::new(2);

        let (_c1, s1) = duplex(64);
        let (_c2, s2) = duplex(64);
        tx.send(s1).await.unwrap();
        tx.send(s2).await.unwrap();

        assert!(listener.accept().await.unwrap().is_ok());
        assert!(listener.accept().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn closed_sender_exhausts_the_source() {
        let (tx, mut listener) = StreamListener::<tokio::io::DuplexStream>::new(1);
        drop(tx);

        assert!(listener.accept().await.is_none());
    }
}
