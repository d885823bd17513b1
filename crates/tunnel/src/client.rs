//! Runs on the agent host: dials the proxy over QUIC, authenticates, then indefinitely accepts
//! streams pushed by the proxy and serves each as a local HTTP proxy request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint};
use reverse_core::prelude::*;
use reverse_httpproxy::HandlerConfig;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::dialer::AgentStream;
use crate::server::ALPN;
use crate::stream_pair::StreamPair;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const KEEP_ALIVE: Duration = Duration::from_secs(10);

pub struct AgentClientConfig {
	pub server_addr: SocketAddr,
	pub server_name: String,
	pub token: SecretString,
	pub handler: HandlerConfig,
}

pub fn client_endpoint_config(mut tls: rustls::ClientConfig) -> anyhow::Result<ClientConfig> {
	tls.alpn_protocols = vec![ALPN.to_vec()];
	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut client_config = ClientConfig::new(Arc::new(quic_tls));
	let mut transport = quinn::TransportConfig::default();
	transport.keep_alive_interval(Some(KEEP_ALIVE));
	client_config.transport_config(Arc::new(transport));
	Ok(client_config)
}

/// Runs the reconnect loop until `cancel` fires. Every fatal error (dial, auth, accept) tears
/// down the connection and retries after `RECONNECT_BACKOFF`.
pub async fn run(cfg: AgentClientConfig, endpoint: Endpoint, cancel: CancellationToken) {
	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => return,
			res = run_once(&cfg, &endpoint) => {
				if let Err(e) = res {
					warn!(error = %e, "agent connection ended, reconnecting");
				}
			}
		}
		tokio::select! {
			biased;
			_ = cancel.cancelled() => return,
			_ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
		}
	}
}

async fn run_once(cfg: &AgentClientConfig, endpoint: &Endpoint) -> anyhow::Result<()> {
	let conn = endpoint.connect(cfg.server_addr, &cfg.server_name)?.await?;
	debug!(server = %cfg.server_addr, "QUIC connection established");

	let (mut send, mut recv) = conn.open_bi().await?;
	crate::auth::run_agent_side(&mut StreamPair(&mut send, &mut recv), cfg.token.expose_secret()).await?;
	let _ = send.finish();
	info!("authenticated with proxy");

	loop {
		let (send, recv) = conn.accept_bi().await?;
		let handler = cfg.handler.clone();
		let local_addr: SocketAddr = conn
			.local_ip()
			.map(|ip| SocketAddr::new(ip, 0))
			.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
		let remote_addr = conn.remote_address();
		tokio::spawn(async move {
			let stream = AgentStream {
				send,
				recv,
				local_addr,
				remote_addr,
			};
			if let Err(e) = reverse_httpproxy::serve(&handler, stream).await {
				warn!(error = %e, "local proxy handler failed");
			}
		});
	}
}
