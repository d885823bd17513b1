use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Shared proxy/LB listener settings, loaded from the environment the way the rest of this stack
/// loads its ambient configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
	pub http_addr: SocketAddr,
	pub proxy_only: bool,
	pub whitelist: String,
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
	pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct QuicConfig {
	pub quic_addr: SocketAddr,
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
	pub server_addr: SocketAddr,
	pub server_name: String,
	pub agent_id: String,
	pub token: String,
	pub insecure_skip_verify: bool,
	pub whitelist: String,
}

pub fn parse_proxy_config() -> anyhow::Result<ProxyConfig> {
	Ok(ProxyConfig {
		http_addr: parse_default("HTTP_ADDR", "127.0.0.1:3128".parse().unwrap())?,
		proxy_only: parse_default("PROXY_ONLY", false)?,
		whitelist: parse::<String>("WHITELIST")?.unwrap_or_default(),
		cert_path: parse::<PathBuf>("TLS_CERT")?,
		key_path: parse::<PathBuf>("TLS_KEY")?,
		dial_timeout: parse_duration_default("AGENT_DIAL_TIMEOUT", Duration::from_secs(10))?,
	})
}

pub fn parse_quic_config() -> anyhow::Result<QuicConfig> {
	Ok(QuicConfig {
		quic_addr: parse_default("QUIC_ADDR", "0.0.0.0:4242".parse().unwrap())?,
		cert_path: parse::<PathBuf>("TLS_CERT")?,
		key_path: parse::<PathBuf>("TLS_KEY")?,
	})
}

pub fn parse_agent_config() -> anyhow::Result<AgentConfig> {
	Ok(AgentConfig {
		server_addr: parse("SERVER_ADDR")?.ok_or_else(|| anyhow::anyhow!("SERVER_ADDR is required"))?,
		server_name: parse::<String>("SERVER_NAME")?.unwrap_or_else(|| "localhost".to_string()),
		agent_id: parse::<String>("AGENT_ID")?.ok_or_else(|| anyhow::anyhow!("AGENT_ID is required"))?,
		token: parse::<String>("AGENT_TOKEN")?.unwrap_or_default(),
		insecure_skip_verify: parse_default("INSECURE_SKIP_VERIFY", false)?,
		whitelist: parse::<String>("EGRESS_WHITELIST")?.unwrap_or_default(),
	})
}

/// A JWT verification key plus the claims it's checked against, loaded from an Ed25519 public-key
/// file the way `auth key public` writes it out (DER/raw bytes, `EdDSA` only).
#[derive(Clone)]
pub struct JwtConfig {
	pub decoding_key: jsonwebtoken::DecodingKey,
	pub algorithm: jsonwebtoken::Algorithm,
	pub audience: Option<HashSet<String>>,
}

/// Verifies agents dialing the QUIC tunnel listener. `None` means the listener falls back to
/// `NoAuthVerifier`.
pub fn parse_agent_jwt_config() -> anyhow::Result<Option<JwtConfig>> {
	parse_jwt_config("AGENT_JWT_PUBLIC_KEY", "AGENT_JWT_AUDIENCE")
}

/// Verifies `Proxy-Authorization: Basic` credentials presented by clients on the HTTP proxy
/// listener (`proxy` and `lb` roles). `None` means the listener falls back to no client auth.
pub fn parse_client_jwt_config() -> anyhow::Result<Option<JwtConfig>> {
	parse_jwt_config("CLIENT_JWT_PUBLIC_KEY", "CLIENT_JWT_AUDIENCE")
}

fn parse_jwt_config(key_env: &str, aud_env: &str) -> anyhow::Result<Option<JwtConfig>> {
	let Some(path) = parse::<PathBuf>(key_env)? else {
		return Ok(None);
	};
	let der = std::fs::read(&path).map_err(|e| anyhow::anyhow!("failed to read {key_env} ({}): {e}", path.display()))?;
	let audience = parse::<String>(aud_env)?.map(|a| HashSet::from([a]));
	Ok(Some(JwtConfig {
		decoding_key: jsonwebtoken::DecodingKey::from_ed_der(&der),
		algorithm: jsonwebtoken::Algorithm::EdDSA,
		audience,
	}))
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())),
		Err(_) => Ok(None),
	}
}

fn parse_default<T: FromStr>(env: &str, default: T) -> anyhow::Result<T>
where
	<T as FromStr>::Err: ToString,
{
	parse(env).map(|v| v.unwrap_or(default))
}

fn parse_duration_default(env: &str, default: Duration) -> anyhow::Result<Duration> {
	match env::var(env) {
		Ok(val) => duration_str::parse(&val).map_err(|e| anyhow::anyhow!("invalid env var {}={} ({})", env, val, e)),
		Err(_) => Ok(default),
	}
}
