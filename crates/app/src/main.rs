mod auth_cli;
mod cli;
mod config;

use std::sync::Arc;

use clap::Parser;
use reverse_core::{drain, readiness, signal, telemetry, version};
use reverse_httpproxy::{ClientAuthenticator, DirectDialer, HandlerConfig, HttpConnector, JwtClientAuthenticator, LoadBalancerDialer};
use reverse_registry::{InMemoryRegistry, Registry};
use reverse_tunnel::{AgentClientConfig, AgentDialer, ConnTrack, JwtVerifier, NoAuthVerifier, TokenVerifier};
use reverse_whitelist::Whitelist;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cli::{AuthCommand, Cli, Command};

fn main() -> anyhow::Result<()> {
	let _log_flush = telemetry::setup_logging();
	let _ = rustls::crypto::ring::default_provider().install_default();

	let cli = Cli::parse();
	match cli.command {
		Command::Version => {
			println!("{}", version::BuildInfo::new());
			return Ok(());
		},
		Command::Auth {
			command: AuthCommand::Key { command },
		} => return auth_cli::run_key(&command),
		Command::Auth {
			command: AuthCommand::Jwt { command },
		} => return auth_cli::run_jwt(&command),
		Command::Agent => run_async(run_agent()),
		Command::Proxy => run_async(run_proxy()),
		Command::Lb => run_async(run_lb()),
	}
}

fn run_async(fut: impl std::future::Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(fut)
}

async fn run_proxy() -> anyhow::Result<()> {
	info!("version: {}", version::BuildInfo::new());
	let http_cfg = config::parse_proxy_config()?;
	let quic_cfg = config::parse_quic_config()?;

	let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
	let proxy_endpoint = reverse_core::strng::new(http_cfg.http_addr.to_string());
	let tracker = Arc::new(ConnTrack::new(registry, proxy_endpoint));

	let dialer = AgentDialer::new(tracker.clone()).with_dial_timeout(http_cfg.dial_timeout);
	let handler_cfg = HandlerConfig {
		dialer: Arc::new(HttpConnector::new(dialer, false)),
		authenticator: client_authenticator()?,
		whitelist: Arc::new(Whitelist::parse(&http_cfg.whitelist)),
		proxy_only: http_cfg.proxy_only,
		buffer_pool: reverse_core::copy::BufferPool::new(),
	};

	let ready = readiness::Ready::new();
	let (drain_trigger, drain_watcher) = drain::new();
	let shutdown = signal::Shutdown::new();

	let cert = http_cfg
		.cert_path
		.clone()
		.ok_or_else(|| anyhow::anyhow!("TLS_CERT is required to run the QUIC listener"))?;
	let key = http_cfg
		.key_path
		.clone()
		.ok_or_else(|| anyhow::anyhow!("TLS_KEY is required to run the QUIC listener"))?;
	let certs = reverse_tunnel::config::load_cert_chain(&cert)?;
	let private_key = reverse_tunnel::config::load_private_key(&key)?;
	let server_config = reverse_tunnel::server_config(certs[0].clone(), private_key)?;
	let endpoint = quinn::Endpoint::server(server_config, quic_cfg.quic_addr)?;
	info!(addr = %quic_cfg.quic_addr, "QUIC agent listener bound");

	let quic_ready = ready.register_task("quic-listener");
	let verifier = agent_verifier()?;
	let quic_watcher = drain_watcher.clone();
	let quic_task = tokio::spawn(async move {
		drop(quic_ready);
		reverse_tunnel::run_server(endpoint, tracker, verifier, quic_watcher).await;
	});

	let http_ready = ready.register_task("http-listener");
	let listener = TcpListener::bind(http_cfg.http_addr).await?;
	info!(addr = %http_cfg.http_addr, "HTTP proxy listener bound");
	let http_watcher = drain_watcher.clone();
	let http_task = tokio::spawn(async move {
		drop(http_ready);
		serve_http(listener, handler_cfg, http_watcher).await;
	});

	drop(drain_watcher);
	shutdown.wait().await;
	info!("shutdown requested, draining");
	drain_trigger.start_drain_and_wait(drain::DrainMode::Graceful).await;
	quic_task.abort();
	http_task.abort();
	Ok(())
}

async fn run_lb() -> anyhow::Result<()> {
	info!("version: {}", version::BuildInfo::new());
	let http_cfg = config::parse_proxy_config()?;
	let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());

	let dialer = LoadBalancerDialer::new(registry);
	let handler_cfg = HandlerConfig {
		dialer: Arc::new(HttpConnector::new(dialer, true)),
		authenticator: client_authenticator()?,
		whitelist: Arc::new(Whitelist::parse(&http_cfg.whitelist)),
		proxy_only: http_cfg.proxy_only,
		buffer_pool: reverse_core::copy::BufferPool::new(),
	};

	let (_drain_trigger, drain_watcher) = drain::new();
	let shutdown = signal::Shutdown::new();
	let listener = TcpListener::bind(http_cfg.http_addr).await?;
	info!(addr = %http_cfg.http_addr, "LB HTTP listener bound");
	let task = tokio::spawn(serve_http(listener, handler_cfg, drain_watcher));

	shutdown.wait().await;
	task.abort();
	Ok(())
}

/// Builds the QUIC tunnel's agent verifier from `AGENT_JWT_PUBLIC_KEY`/`AGENT_JWT_AUDIENCE`,
/// falling back to [`NoAuthVerifier`] when unset.
fn agent_verifier() -> anyhow::Result<Arc<dyn TokenVerifier>> {
	Ok(match config::parse_agent_jwt_config()? {
		Some(jwt) => Arc::new(JwtVerifier {
			decoding_key: jwt.decoding_key,
			algorithm: jwt.algorithm,
			audience: jwt.audience,
		}),
		None => Arc::new(NoAuthVerifier),
	})
}

/// Builds the HTTP proxy listener's client authenticator from
/// `CLIENT_JWT_PUBLIC_KEY`/`CLIENT_JWT_AUDIENCE`. `None` leaves `Proxy-Authorization` unchecked.
fn client_authenticator() -> anyhow::Result<Option<Arc<dyn ClientAuthenticator>>> {
	Ok(config::parse_client_jwt_config()?.map(|jwt| {
		Arc::new(JwtClientAuthenticator {
			decoding_key: jwt.decoding_key,
			algorithm: jwt.algorithm,
			audience: jwt.audience,
		}) as Arc<dyn ClientAuthenticator>
	}))
}

async fn run_agent() -> anyhow::Result<()> {
	info!("version: {}", version::BuildInfo::new());
	let cfg = config::parse_agent_config()?;

	let tls = reverse_tunnel::config::client_tls_config(cfg.insecure_skip_verify)?;
	let client_config = reverse_tunnel::client::client_endpoint_config(tls)?;
	let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse()?)?;
	endpoint.set_default_client_config(client_config);

	let handler_cfg = HandlerConfig {
		dialer: Arc::new(DirectDialer),
		authenticator: client_authenticator()?,
		whitelist: Arc::new(Whitelist::parse(&cfg.whitelist)),
		proxy_only: false,
		buffer_pool: reverse_core::copy::BufferPool::new(),
	};

	let client_cfg = AgentClientConfig {
		server_addr: cfg.server_addr,
		server_name: cfg.server_name,
		token: secrecy::SecretString::new(
			if cfg.token.is_empty() { cfg.agent_id.clone() } else { cfg.token }.into(),
		),
		handler: handler_cfg,
	};

	let cancel = CancellationToken::new();
	let shutdown = signal::Shutdown::new();
	let run_cancel = cancel.clone();
	let client_task = tokio::spawn(reverse_tunnel::run_client(client_cfg, endpoint, run_cancel));

	shutdown.wait().await;
	cancel.cancel();
	let _ = client_task.await;
	Ok(())
}

const ACCEPT_BACKOFF_INITIAL: std::time::Duration = std::time::Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: std::time::Duration = std::time::Duration::from_secs(5);

async fn serve_http(listener: TcpListener, handler_cfg: HandlerConfig, drain: drain::DrainWatcher) {
	let mut drain_wait = Box::pin(drain.wait_for_drain());
	let mut accept_backoff = std::time::Duration::ZERO;
	loop {
		let accepted = tokio::select! {
			biased;
			release = &mut drain_wait => {
				drop(release);
				return;
			}
			accepted = listener.accept() => accepted,
		};
		let (stream, peer) = match accepted {
			Ok(pair) => pair,
			Err(e) => {
				accept_backoff = if accept_backoff.is_zero() {
					ACCEPT_BACKOFF_INITIAL
				} else {
					(accept_backoff * 2).min(ACCEPT_BACKOFF_MAX)
				};
				tracing::warn!(error = %e, backoff = ?accept_backoff, "accept failed on HTTP proxy listener, retrying");
				tokio::select! {
					biased;
					release = &mut drain_wait => {
						drop(release);
						return;
					}
					_ = tokio::time::sleep(accept_backoff) => {}
				}
				continue;
			},
		};
		accept_backoff = std::time::Duration::ZERO;
		let cfg = handler_cfg.clone();
		tokio::spawn(async move {
			if let Err(e) = reverse_httpproxy::serve(&cfg, stream).await {
				tracing::debug!(%peer, error = %e, "HTTP proxy connection ended with error");
			}
		});
	}
}
