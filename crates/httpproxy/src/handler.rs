use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reverse_core::prelude::*;
use reverse_whitelist::Whitelist;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::auth::ClientAuthenticator;
use crate::dialer::{DialContext, Dialer};

/// Configures one [`HttpProxyHandler`] instance. Shared, immutable for the handler's lifetime.
#[derive(Clone)]
pub struct HandlerConfig {
	pub dialer: Arc<dyn Dialer>,
	pub authenticator: Option<Arc<dyn ClientAuthenticator>>,
	pub whitelist: Arc<Whitelist>,
	/// `CONNECT`-only mode: absolute-form forward requests are rejected with `405`.
	pub proxy_only: bool,
	pub buffer_pool: reverse_core::copy::BufferPool,
}

struct ParsedRequest {
	method: String,
	target: String,
	headers: Vec<(String, String)>,
	raw_request_line: String,
	host: Option<String>,
}

/// Runs the full HTTP CONNECT / forward-proxy state machine on one accepted connection:
/// read-request, policy gate, client auth, whitelist bypass, dial, tunnel.
pub async fn serve<S>(cfg: &HandlerConfig, mut conn: S) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let req = match read_request(&mut conn).await? {
		Some(req) => req,
		None => return Ok(()),
	};

	if cfg.proxy_only && req.method != "CONNECT" {
		write_status(&mut conn, 405, "Method Not Allowed").await?;
		return Ok(());
	}
	if req.method == "PRI" || (req.method != "CONNECT" && !is_http_forward(&req)) {
		write_status(&mut conn, 400, "Bad Request").await?;
		return Ok(());
	}

	let (client_id, proxy_authorization) = match authenticate(cfg, &req) {
		AuthOutcome::Ok { id, raw } => (id, raw),
		AuthOutcome::Rejected => {
			write_407(&mut conn).await?;
			return Ok(());
		}
	};

	let dst = normalize_target(&req);
	if !cfg.whitelist.is_empty() && cfg.whitelist.contains(&dst) {
		write_status(&mut conn, 403, "Forbidden").await?;
		return Ok(());
	}

	let ctx = DialContext {
		client_id,
		proxy_authorization,
	};
	let upstream = match cfg.dialer.dial(&ctx, &dst).await {
		Ok(u) => u,
		Err(e) => {
			debug!(error = %e, target = %dst, "dial failed");
			write_status(&mut conn, 503, "Service Unavailable").await?;
			return Ok(());
		}
	};

	if req.method == "CONNECT" {
		write_status(&mut conn, 200, "Connection established").await?;
	} else {
		forward_request(&mut conn, &req).await?;
	}

	let (up, down) = reverse_core::copy::copy_bidirectional(&cfg.buffer_pool, conn, upstream).await?;
	trace!(bytes_up = up, bytes_down = down, "tunnel closed");
	Ok(())
}

enum AuthOutcome {
	Ok {
		id: Strng,
		raw: Option<Strng>,
	},
	Rejected,
}

fn authenticate(cfg: &HandlerConfig, req: &ParsedRequest) -> AuthOutcome {
	let header = req
		.headers
		.iter()
		.find(|(k, _)| k.eq_ignore_ascii_case("Proxy-Authorization"))
		.map(|(_, v)| v.clone());

	let Some(authenticator) = &cfg.authenticator else {
		return AuthOutcome::Ok {
			id: strng::new(""),
			raw: header.map(strng::new),
		};
	};

	let Some(header) = header else {
		return AuthOutcome::Rejected;
	};
	let Some((user, pass)) = decode_basic(&header) else {
		return AuthOutcome::Rejected;
	};
	match authenticator.authenticate(&user, &pass) {
		Some(id) => AuthOutcome::Ok {
			id,
			raw: Some(strng::new(header)),
		},
		None => AuthOutcome::Rejected,
	}
}

fn decode_basic(header: &str) -> Option<(String, String)> {
	let rest = header.strip_prefix("Basic ")?;
	let decoded = BASE64.decode(rest.trim()).ok()?;
	let text = String::from_utf8(decoded).ok()?;
	let (user, pass) = text.split_once(':')?;
	Some((user.to_string(), pass.to_string()))
}

fn is_http_forward(req: &ParsedRequest) -> bool {
	req.target.starts_with("http://") || (!req.target.contains("://") && req.method != "CONNECT")
}

fn normalize_target(req: &ParsedRequest) -> String {
	let authority = if req.method == "CONNECT" {
		req.target.clone()
	} else if let Some(rest) = req.target.strip_prefix("http://") {
		rest.split('/').next().unwrap_or(rest).to_string()
	} else {
		// Origin-form forward request (`GET /foo HTTP/1.1`): the target is a bare path, so the
		// destination comes from the Host header instead.
		req.host.clone().unwrap_or_else(|| req.target.clone())
	};
	if authority.contains(':') && !authority.starts_with('[') {
		authority
	} else {
		format!("{authority}:80")
	}
}

async fn forward_request<S: AsyncWrite + Unpin>(conn: &mut S, req: &ParsedRequest) -> anyhow::Result<()> {
	let mut out = req.raw_request_line.clone();
	out.push_str("\r\n");
	for (k, v) in &req.headers {
		if k.eq_ignore_ascii_case("Proxy-Connection") || k.eq_ignore_ascii_case("Proxy-Authorization") {
			continue;
		}
		out.push_str(k);
		out.push_str(": ");
		out.push_str(v);
		out.push_str("\r\n");
	}
	out.push_str("\r\n");
	conn.write_all(out.as_bytes()).await?;
	Ok(())
}

async fn read_request<S: AsyncRead + Unpin>(conn: &mut S) -> anyhow::Result<Option<ParsedRequest>> {
	let mut reader = BufReader::new(conn);
	let mut request_line = String::new();
	if reader.read_line(&mut request_line).await? == 0 {
		return Ok(None);
	}
	let trimmed = request_line.trim_end_matches(['\r', '\n']).to_string();
	let mut parts = trimmed.split_whitespace();
	let method = parts.next().unwrap_or_default().to_string();
	let target = parts.next().unwrap_or_default().to_string();

	let mut headers = Vec::new();
	loop {
		let mut line = String::new();
		let n = reader.read_line(&mut line).await?;
		if n == 0 {
			break;
		}
		let line = line.trim_end_matches(['\r', '\n']);
		if line.is_empty() {
			break;
		}
		if let Some((k, v)) = line.split_once(':') {
			headers.push((k.trim().to_string(), v.trim().to_string()));
		}
	}

	let host = headers
		.iter()
		.find(|(k, _)| k.eq_ignore_ascii_case("Host"))
		.map(|(_, v)| v.clone());

	Ok(Some(ParsedRequest {
		method,
		target,
		headers,
		raw_request_line: trimmed,
		host,
	}))
}

async fn write_status<S: AsyncWrite + Unpin>(conn: &mut S, code: u16, reason: &str) -> anyhow::Result<()> {
	let body = format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
	conn.write_all(body.as_bytes()).await?;
	Ok(())
}

async fn write_407<S: AsyncWrite + Unpin>(conn: &mut S) -> anyhow::Result<()> {
	let body = concat!(
		"HTTP/1.1 407 Proxy Authentication Required\r\n",
		"Proxy-Authenticate: Basic realm=\"reverse-http\"\r\n",
		"Content-Length: 0\r\n",
		"Connection: close\r\n\r\n"
	);
	conn.write_all(body.as_bytes()).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::auth::NoAuthClientAuthenticator;
	use crate::dialer::DirectDialer;

	fn cfg(proxy_only: bool, auth: Option<Arc<dyn ClientAuthenticator>>) -> HandlerConfig {
		HandlerConfig {
			dialer: Arc::new(DirectDialer),
			authenticator: auth,
			whitelist: Arc::new(Whitelist::parse("")),
			proxy_only,
			buffer_pool: reverse_core::copy::BufferPool::new(),
		}
	}

	#[tokio::test]
	async fn forward_request_rejected_in_proxy_only_mode() {
		let (mut client, server) = tokio::io::duplex(4096);
		let handler = tokio::spawn(async move { serve(&cfg(true, None), server).await });
		client
			.write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
			.await
			.unwrap();
		let mut buf = vec![0u8; 512];
		let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
		let resp = String::from_utf8_lossy(&buf[..n]);
		assert!(resp.starts_with("HTTP/1.1 405"), "got: {resp}");
		handler.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn missing_credentials_get_407() {
		let auth: Arc<dyn ClientAuthenticator> = Arc::new(NoAuthClientAuthenticator);
		let (mut client, server) = tokio::io::duplex(4096);
		let handler = tokio::spawn(async move { serve(&cfg(false, Some(auth)), server).await });
		client
			.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
			.await
			.unwrap();
		let mut buf = vec![0u8; 512];
		let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
		let resp = String::from_utf8_lossy(&buf[..n]);
		assert!(resp.starts_with("HTTP/1.1 407"), "got: {resp}");
		handler.await.unwrap().unwrap();
	}

	#[derive(Debug)]
	struct RecordingDialer(std::sync::Arc<std::sync::Mutex<Option<String>>>);

	#[async_trait::async_trait]
	impl Dialer for RecordingDialer {
		async fn dial(&self, _ctx: &DialContext, target: &str) -> anyhow::Result<crate::dialer::BoxedUpstream> {
			*self.0.lock().unwrap() = Some(target.to_string());
			anyhow::bail!("test dialer never connects")
		}
	}

	#[tokio::test]
	async fn origin_form_forward_resolves_destination_from_host_header() {
		// The request line carries only a bare path ("/foo"); the dial target must come from the
		// Host header, not the literal path.
		let dialed = std::sync::Arc::new(std::sync::Mutex::new(None));
		let cfg = HandlerConfig {
			dialer: Arc::new(RecordingDialer(dialed.clone())),
			authenticator: None,
			whitelist: Arc::new(Whitelist::parse("")),
			proxy_only: false,
			buffer_pool: reverse_core::copy::BufferPool::new(),
		};
		let (mut client, server) = tokio::io::duplex(4096);
		let handler = tokio::spawn(async move { serve(&cfg, server).await });
		client
			.write_all(b"GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n")
			.await
			.unwrap();
		let mut buf = vec![0u8; 512];
		let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
		let resp = String::from_utf8_lossy(&buf[..n]);
		assert!(resp.starts_with("HTTP/1.1 503"), "got: {resp}");
		handler.await.unwrap().unwrap();
		assert_eq!(dialed.lock().unwrap().as_deref(), Some("example.com:80"));
	}

	#[tokio::test]
	async fn whitelist_bypass_rejects_unlisted_destination() {
		let cfg = HandlerConfig {
			dialer: Arc::new(DirectDialer),
			authenticator: None,
			whitelist: Arc::new(Whitelist::parse("10.0.0.0/8")),
			proxy_only: false,
			buffer_pool: reverse_core::copy::BufferPool::new(),
		};
		let (mut client, server) = tokio::io::duplex(4096);
		let handler = tokio::spawn(async move { serve(&cfg, server).await });
		client
			.write_all(b"CONNECT 93.184.216.34:443 HTTP/1.1\r\nHost: 93.184.216.34:443\r\n\r\n")
			.await
			.unwrap();
		let mut buf = vec![0u8; 512];
		let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
		let resp = String::from_utf8_lossy(&buf[..n]);
		assert!(resp.starts_with("HTTP/1.1 403"), "got: {resp}");
		handler.await.unwrap().unwrap();
	}
}
