//! Adapts a split QUIC `SendStream`/`RecvStream` pair into a single `AsyncRead + AsyncWrite` type,
//! the shape [`crate::auth::run_agent_side`] and [`crate::auth::run_proxy_side`] expect.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) struct StreamPair<'a>(pub &'a mut quinn::SendStream, pub &'a mut quinn::RecvStream);

impl AsyncRead for StreamPair<'_> {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		let this = self.get_mut();
		Pin::new(&mut *this.1).poll_read(cx, buf)
	}
}

impl AsyncWrite for StreamPair<'_> {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		let this = self.get_mut();
		AsyncWrite::poll_write(Pin::new(&mut *this.0), cx, buf)
	}
	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		let this = self.get_mut();
		Pin::new(&mut *this.0).poll_flush(cx)
	}
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		let this = self.get_mut();
		Pin::new(&mut *this.0).poll_shutdown(cx)
	}
}
