use std::net::SocketAddr;

use async_trait::async_trait;
use reverse_core::prelude::*;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// A pseudo-net-connection handed back by a `Dialer`: something `HttpProxyHandler` can tunnel
/// bytes through, plus the addressing metadata a `CONNECT` response or logging might want.
pub trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {
	fn local_addr(&self) -> SocketAddr;
	fn remote_addr(&self) -> SocketAddr;
}

pub type BoxedUpstream = Box<dyn UpstreamStream>;

/// Context carried from the authenticated client request into the dial, so a `Dialer` can route
/// on `clientID`/`agentID` or re-forward the original `Proxy-Authorization` credentials.
#[derive(Clone, Debug, Default)]
pub struct DialContext {
	pub client_id: Strng,
	pub proxy_authorization: Option<Strng>,
}

/// Resolves a `host:port` destination to an upstream connection. In the proxy role this is an
/// `AgentDialer` multiplexing a QUIC stream; in the LB role it is a `LoadBalancerDialer` opening a
/// TCP/TLS connection to the proxy that owns the target agent.
#[async_trait]
pub trait Dialer: Send + Sync + std::fmt::Debug {
	async fn dial(&self, ctx: &DialContext, target: &str) -> anyhow::Result<BoxedUpstream>;
}

pub(crate) struct TcpUpstream {
	pub(crate) stream: tokio::net::TcpStream,
	pub(crate) local: SocketAddr,
	pub(crate) remote: SocketAddr,
}

impl UpstreamStream for TcpUpstream {
	fn local_addr(&self) -> SocketAddr {
		self.local
	}
	fn remote_addr(&self) -> SocketAddr {
		self.remote
	}
}

impl AsyncRead for TcpUpstream {
	fn poll_read(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
	}
}

impl AsyncWrite for TcpUpstream {
	fn poll_write(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<std::io::Result<usize>> {
		std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
	}
	fn poll_flush(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.stream).poll_flush(cx)
	}
	fn poll_shutdown(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
	}
}

/// Dials the target's `host:port` directly over plain TCP. Used by the agent's local
/// `HttpProxyHandler` to reach origin servers on its own network.
#[derive(Debug, Default, Clone)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
	async fn dial(&self, _ctx: &DialContext, target: &str) -> anyhow::Result<BoxedUpstream> {
		let stream = tokio::net::TcpStream::connect(target).await?;
		stream.set_nodelay(true)?;
		let local = stream.local_addr()?;
		let remote = stream.peer_addr()?;
		Ok(Box::new(TcpUpstream {
			stream,
			local,
			remote,
		}))
	}
}

/// Opens a raw, protocol-less transport to the next hop: a freshly multiplexed QUIC stream for
/// `AgentDialer`, or a TCP/TLS connection to an owning proxy for `LoadBalancerDialer`. Pairs with
/// [`HttpConnector`] to become a full [`Dialer`] by layering an HTTP `CONNECT` handshake on top.
#[async_trait]
pub trait RawDialer: Send + Sync + std::fmt::Debug {
	async fn dial_raw(&self, ctx: &DialContext, target: &str) -> anyhow::Result<BoxedUpstream>;
}

/// Wraps a [`RawDialer`] and speaks HTTP `CONNECT` over the resulting transport before handing
/// the (now tunnel-ready) stream back to the caller's `HttpProxyHandler`. When `forward_auth` is
/// set, the `DialContext`'s original `Proxy-Authorization` value is re-serialized onto the
/// `CONNECT` request so the next hop's client-authenticator accepts it.
#[derive(Debug)]
pub struct HttpConnector<D> {
	inner: D,
	forward_auth: bool,
}

impl<D: RawDialer> HttpConnector<D> {
	pub fn new(inner: D, forward_auth: bool) -> Self {
		Self { inner, forward_auth }
	}
}

#[async_trait]
impl<D: RawDialer> Dialer for HttpConnector<D> {
	async fn dial(&self, ctx: &DialContext, target: &str) -> anyhow::Result<BoxedUpstream> {
		let mut raw = self.inner.dial_raw(ctx, target).await?;

		let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
		if self.forward_auth {
			if let Some(auth) = &ctx.proxy_authorization {
				req.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
			}
		}
		req.push_str("\r\n");
		raw.write_all(req.as_bytes()).await?;
		raw.flush().await?;

		let (status, leftover) = read_connect_status(&mut raw).await?;
		if status != 200 {
			anyhow::bail!("upstream CONNECT to {target} failed with status {status}");
		}
		if leftover.is_empty() {
			Ok(raw)
		} else {
			Ok(Box::new(PrefixedUpstream::new(leftover, raw)))
		}
	}
}

/// Reads a status line and headers off `stream` up to the blank line, returning the status code
/// and any bytes the reader's internal buffer already pulled in past the header block (the origin
/// server's response can arrive on the same read as the `CONNECT` reply's trailing blank line).
async fn read_connect_status(stream: &mut BoxedUpstream) -> anyhow::Result<(u16, Vec<u8>)> {
	let mut reader = BufReader::new(&mut *stream);
	let mut status_line = String::new();
	reader.read_line(&mut status_line).await?;
	let mut parts = status_line.split_whitespace();
	let _version = parts.next();
	let code: u16 = parts
		.next()
		.ok_or_else(|| anyhow::anyhow!("malformed CONNECT response status line"))?
		.parse()?;
	loop {
		let mut line = String::new();
		let n = reader.read_line(&mut line).await?;
		if n == 0 || line == "\r\n" || line == "\n" {
			break;
		}
	}
	Ok((code, reader.buffer().to_vec()))
}

/// Replays bytes an upstream reader buffered past a handshake's header block before delegating
/// further reads to `inner`. Writes, shutdown, and addressing pass straight through.
struct PrefixedUpstream {
	prefix: Vec<u8>,
	prefix_pos: usize,
	inner: BoxedUpstream,
}

impl PrefixedUpstream {
	fn new(prefix: Vec<u8>, inner: BoxedUpstream) -> Self {
		Self {
			prefix,
			prefix_pos: 0,
			inner,
		}
	}
}

impl UpstreamStream for PrefixedUpstream {
	fn local_addr(&self) -> SocketAddr {
		self.inner.local_addr()
	}
	fn remote_addr(&self) -> SocketAddr {
		self.inner.remote_addr()
	}
}

impl AsyncRead for PrefixedUpstream {
	fn poll_read(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		if self.prefix_pos < self.prefix.len() {
			let remaining = &self.prefix[self.prefix_pos..];
			let n = remaining.len().min(buf.remaining());
			buf.put_slice(&remaining[..n]);
			self.prefix_pos += n;
			return std::task::Poll::Ready(Ok(()));
		}
		std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for PrefixedUpstream {
	fn poll_write(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<std::io::Result<usize>> {
		std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
	}
	fn poll_flush(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.inner).poll_flush(cx)
	}
	fn poll_shutdown(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}
