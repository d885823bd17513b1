//! QUIC listener run on the proxy host. Accepts agent connections, runs the proxy side of
//! `AuthFlow` on each, and installs the result into `ConnTrack`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{Endpoint, ServerConfig};
use reverse_core::drain::DrainWatcher;
use reverse_core::prelude::*;

use crate::auth::{self, TokenVerifier};
use crate::conntrack::{self, AgentConnection, ConnTrack};
use crate::dialer::AgentStream;

pub const ALPN: &[u8] = b"reverse-http-proto";
const KEEP_ALIVE: Duration = Duration::from_secs(10);

const ERR_INTERNAL: u32 = 500;
const ERR_EMPTY_AGENT_ID: u32 = 400;

struct QuicAgentConnection {
	conn: quinn::Connection,
	id: conntrack::ConnectionId,
}

impl std::fmt::Debug for QuicAgentConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("QuicAgentConnection")
			.field("id", &self.id)
			.field("remote", &self.conn.remote_address())
			.finish()
	}
}

#[async_trait]
impl AgentConnection for QuicAgentConnection {
	fn id(&self) -> conntrack::ConnectionId {
		self.id
	}

	async fn open_bi(&self) -> anyhow::Result<AgentStream> {
		let (send, recv) = self.conn.open_bi().await?;
		Ok(AgentStream {
			send,
			recv,
			local_addr: local_socket_addr(&self.conn),
			remote_addr: self.conn.remote_address(),
		})
	}

	async fn close(&self, code: u32, reason: &str) {
		self.conn.close(code.into(), reason.as_bytes());
	}
}

fn local_socket_addr(conn: &quinn::Connection) -> SocketAddr {
	conn.local_ip()
		.map(|ip| SocketAddr::new(ip, 0))
		.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap())
}

pub fn server_config(cert: rustls::pki_types::CertificateDer<'static>, key: rustls::pki_types::PrivateKeyDer<'static>) -> anyhow::Result<ServerConfig> {
	let mut tls = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(vec![cert], key)?;
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls)?;
	let mut server_config = ServerConfig::with_crypto(Arc::new(quic_tls));
	let mut transport = quinn::TransportConfig::default();
	transport.keep_alive_interval(Some(KEEP_ALIVE));
	server_config.transport_config(Arc::new(transport));
	Ok(server_config)
}

/// Accepts agent connections on `endpoint`, feeds `ConnTrack`'s lifecycle tracer, and runs until
/// `drain` fires.
// quinn's `Endpoint::accept` already absorbs transient per-connection errors internally and only
// ever yields `None` on endpoint shutdown, so the listener-level exponential backoff degenerates
// to nothing here; handshake failures on one attempt surface through `incoming.await` below and
// are logged per-connection instead of retried by this loop.
pub async fn run(
	endpoint: Endpoint,
	tracker: Arc<ConnTrack>,
	verifier: Arc<dyn TokenVerifier>,
	drain: DrainWatcher,
) {
	let mut drain_wait = Box::pin(drain.wait_for_drain());

	loop {
		let incoming = tokio::select! {
			biased;
			release = &mut drain_wait => {
				info!("agent server shutting down, closing listener");
				endpoint.close(0u32.into(), b"shutting down");
				drop(release);
				return;
			}
			incoming = endpoint.accept() => incoming,
		};

		let Some(incoming) = incoming else {
			info!("agent server endpoint closed");
			return;
		};

		let tracker = tracker.clone();
		let verifier = verifier.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(conn) => handle_connection(conn, tracker, verifier).await,
				Err(e) => warn!(error = %e, "failed to establish incoming QUIC connection"),
			}
		});
	}
}

async fn handle_connection(conn: quinn::Connection, tracker: Arc<ConnTrack>, verifier: Arc<dyn TokenVerifier>) {
	let conn_id = conntrack::allocate_connection_id();
	tracker.on_started(conn_id);

	let result = async {
		let (mut send, mut recv) = conn.accept_bi().await?;
		let attrs = auth::run_proxy_side(&mut crate::stream_pair::StreamPair(&mut send, &mut recv), &*verifier)
			.await
			.map_err(|e| anyhow::anyhow!(e))?;
		Ok::<_, anyhow::Error>(attrs)
	}
	.await;

	match result {
		Ok(attrs) => {
			let wrapped: Arc<dyn AgentConnection> = Arc::new(QuicAgentConnection { conn: conn.clone(), id: conn_id });
			if let Err(e) = tracker.put(attrs.agent_id.clone(), wrapped).await {
				error!(agent_id = %attrs.agent_id, error = %e, "ConnTrack::put failed, closing connection");
			} else {
				debug!(agent_id = %attrs.agent_id, "agent connection established");
			}
		},
		Err(e) => {
			warn!(error = %e, "agent auth failed");
			let code = if e.to_string().contains("empty") {
				ERR_EMPTY_AGENT_ID
			} else {
				ERR_INTERNAL
			};
			conn.close(code.into(), e.to_string().as_bytes());
		},
	}

	conn.closed().await;
	tracker.on_closed(conn_id).await;
}
