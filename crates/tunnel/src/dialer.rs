//! `AgentDialer`: on each client request, opens a fresh bidirectional QUIC stream on the agent's
//! already-established connection and hands it back as a [`RawDialer`]-shaped upstream.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use reverse_core::prelude::*;
use reverse_httpproxy::dialer::{BoxedUpstream, DialContext, RawDialer, UpstreamStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::conntrack::ConnTrack;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A multiplexed QUIC stream pair, the unit `ConnTrack::AgentConnection::open_bi` hands back.
pub struct AgentStream {
	pub send: quinn::SendStream,
	pub recv: quinn::RecvStream,
	pub local_addr: SocketAddr,
	pub remote_addr: SocketAddr,
}

impl UpstreamStream for AgentStream {
	fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}
	fn remote_addr(&self) -> SocketAddr {
		self.remote_addr
	}
}

impl AsyncRead for AgentStream {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.recv).poll_read(cx, buf)
	}
}

impl AsyncWrite for AgentStream {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
	}
	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.send).poll_flush(cx)
	}
	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.send).poll_shutdown(cx)
	}
}

pub struct AgentDialer {
	tracker: Arc<ConnTrack>,
	dial_timeout: Duration,
}

impl std::fmt::Debug for AgentDialer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AgentDialer").field("dial_timeout", &self.dial_timeout).finish()
	}
}

impl AgentDialer {
	pub fn new(tracker: Arc<ConnTrack>) -> Self {
		Self {
			tracker,
			dial_timeout: DEFAULT_DIAL_TIMEOUT,
		}
	}

	pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
		self.dial_timeout = timeout;
		self
	}
}

#[async_trait]
impl RawDialer for AgentDialer {
	async fn dial_raw(&self, ctx: &DialContext, _target: &str) -> anyhow::Result<BoxedUpstream> {
		let agent_id = &ctx.client_id;
		let conn = self
			.tracker
			.get(agent_id)
			.ok_or_else(|| anyhow::anyhow!("connection for agent {agent_id} not found"))?;
		let stream = tokio::time::timeout(self.dial_timeout, conn.open_bi())
			.await
			.map_err(|_| anyhow::anyhow!("dial to agent {agent_id} timed out"))??;
		Ok(Box::new(stream))
	}
}
