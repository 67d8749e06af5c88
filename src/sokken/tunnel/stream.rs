use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What a WebSocket message means to the byte stream carried inside it.
#[derive(Debug)]
pub enum Frame {
    Data(Bytes),
    Text,
    Close,
    Control,
}

/// Message types of the WebSocket libraries used on either end of the tunnel.
pub trait WsMessage: Sized {
    fn binary(data: Bytes) -> Self;
    fn into_frame(self) -> Frame;
}

impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(b) => Frame::Data(b),
            Self::Text(_) => Frame::Text,
            Self::Close(_) => Frame::Close,
            _ => Frame::Control,
        }
    }
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(b) => Frame::Data(b),
            Self::Text(_) => Frame::Text,
            Self::Close(_) => Frame::Close,
            _ => Frame::Control,
        }
    }
}

pin_project! {
    /// Byte stream over a message-oriented WebSocket.
    ///
    /// Every write becomes one binary message; reads concatenate the payloads of
    /// incoming binary messages. A close frame or the end of the message stream reads
    /// as EOF, a text message is a protocol error. Ping/pong are answered by the
    /// underlying library and skipped here.
    pub struct WsByteStream<S> {
        #[pin]
        inner: S,
        pending: Bytes,
        eof: bool,
    }
}

impl<S> WsByteStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }
}

impl<S, M, E> AsyncRead for WsByteStream<S>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E>,
    M: WsMessage,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if this.pending.has_remaining() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if *this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(msg)) => match msg.into_frame() {
                    Frame::Data(b) => *this.pending = b,
                    Frame::Close => *this.eof = true,
                    Frame::Control => {}
                    Frame::Text => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "tunnel: unexpected text message",
                        )));
                    }
                },
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
                None => *this.eof = true,
            }
        }
    }
}

impl<S, M, E> AsyncWrite for WsByteStream<S>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E>,
    M: WsMessage,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut this = self.project();
        ready!(this.inner.as_mut().poll_ready(cx)).map_err(io::Error::other)?;
        this.inner
            .as_mut()
            .start_send(M::binary(Bytes::copy_from_slice(data)))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project()
            .inner
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Sends a close frame and flushes it.
        self.project()
            .inner
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
