//! Length-prefixed bearer-token handshake run on the first stream of every QUIC connection, in
//! both directions: the agent authenticates itself to the proxy before any HTTP traffic flows.

use std::time::Duration;

use async_trait::async_trait;
use reverse_core::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on a single frame's payload. Guards against a peer asserting an absurd length and
/// then drip-feeding bytes forever.
pub const MAX_AUTH_MESSAGE_LENGTH: u32 = 1024 * 1024;

/// Deadline applied independently by each side to its half of the handshake.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("auth frame of {0} bytes exceeds the {max} byte limit", max = MAX_AUTH_MESSAGE_LENGTH)]
	TooLarge(u32),
	#[error("auth handshake timed out")]
	Timeout,
	#[error("token rejected: {0}")]
	Rejected(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Attributes asserted by a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
	pub agent_id: Strng,
	pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Agent,
	Client,
}

/// Turns a bearer token into [`Attributes`], or rejects it. Implementations must reject an empty
/// `agentID` themselves; callers additionally enforce `role == Agent` for the tunnel handshake.
#[async_trait]
pub trait TokenVerifier: Send + Sync + std::fmt::Debug {
	async fn verify(&self, token: &str) -> Result<Attributes, AuthError>;
}

/// Accepts any non-empty token verbatim as the agent id. Used for local testing/development.
#[derive(Debug, Default, Clone)]
pub struct NoAuthVerifier;

#[async_trait]
impl TokenVerifier for NoAuthVerifier {
	async fn verify(&self, token: &str) -> Result<Attributes, AuthError> {
		if token.is_empty() {
			return Err(AuthError::Rejected("empty token".into()));
		}
		Ok(Attributes {
			agent_id: strng::new(token),
			role: Role::Agent,
		})
	}
}

/// Verifies a JWT asserting `claims.role == "agent"` and a non-empty `claims.agentID`.
#[derive(Clone)]
pub struct JwtVerifier {
	pub decoding_key: jsonwebtoken::DecodingKey,
	pub algorithm: jsonwebtoken::Algorithm,
	pub audience: Option<std::collections::HashSet<String>>,
}

impl std::fmt::Debug for JwtVerifier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("JwtVerifier").field("algorithm", &self.algorithm).finish()
	}
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
	async fn verify(&self, token: &str) -> Result<Attributes, AuthError> {
		let mut validation = jsonwebtoken::Validation::new(self.algorithm);
		validation.leeway = 5;
		if let Some(aud) = &self.audience {
			validation.aud = Some(aud.clone());
		} else {
			validation.validate_aud = false;
		}
		let data = jsonwebtoken::decode::<serde_json::Map<String, serde_json::Value>>(
			token,
			&self.decoding_key,
			&validation,
		)
		.map_err(|e| AuthError::Rejected(e.to_string()))?;
		let role = data
			.claims
			.get("role")
			.and_then(|v| v.as_str())
			.ok_or_else(|| AuthError::Rejected("missing role claim".into()))?;
		let agent_id = data
			.claims
			.get("agentID")
			.and_then(|v| v.as_str())
			.filter(|s| !s.is_empty())
			.ok_or_else(|| AuthError::Rejected("missing or empty agentID claim".into()))?;
		if role != "agent" {
			return Err(AuthError::Rejected(format!("unexpected role {role}")));
		}
		Ok(Attributes {
			agent_id: strng::new(agent_id),
			role: Role::Agent,
		})
	}
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), AuthError> {
	if payload.len() as u64 > MAX_AUTH_MESSAGE_LENGTH as u64 {
		return Err(AuthError::TooLarge(payload.len() as u32));
	}
	w.write_u32(payload.len() as u32).await?;
	w.write_all(payload).await?;
	Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, AuthError> {
	let len = r.read_u32().await?;
	if len > MAX_AUTH_MESSAGE_LENGTH {
		return Err(AuthError::TooLarge(len));
	}
	let mut buf = vec![0u8; len as usize];
	r.read_exact(&mut buf).await?;
	Ok(buf)
}

/// Runs the agent side of the handshake on a freshly opened stream: send the token, wait for any
/// reply frame, done. `stream` is consumed; callers close it afterward.
pub async fn run_agent_side<S>(stream: &mut S, token: &str) -> Result<(), AuthError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	tokio::time::timeout(AUTH_TIMEOUT, async {
		write_frame(stream, token.as_bytes()).await?;
		let _reply = read_frame(stream).await?;
		Ok(())
	})
	.await
	.map_err(|_| AuthError::Timeout)?
}

/// Runs the proxy side: read the token, verify it, enforce the agent-role/non-empty-id
/// constraints, and write back an acknowledgement frame. Returns the verified attributes.
pub async fn run_proxy_side<S>(
	stream: &mut S,
	verifier: &dyn TokenVerifier,
) -> Result<Attributes, AuthError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	tokio::time::timeout(AUTH_TIMEOUT, async {
		let token = read_frame(stream).await?;
		let token = String::from_utf8(token).map_err(|_| AuthError::Rejected("token is not valid utf-8".into()))?;
		let attrs = verifier.verify(&token).await?;
		if attrs.role != Role::Agent || attrs.agent_id.is_empty() {
			return Err(AuthError::Rejected("expected a non-empty agent identity".into()));
		}
		write_frame(stream, b"authenticated").await?;
		Ok(attrs)
	})
	.await
	.map_err(|_| AuthError::Timeout)?
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn round_trips_tokens_of_varying_length() {
		for len in [0usize, 1, 64, 4096] {
			let (mut a, mut b) = tokio::io::duplex(2 * MAX_AUTH_MESSAGE_LENGTH as usize);
			let token = "x".repeat(len.max(1));
			let token_clone = token.clone();
			let agent = tokio::spawn(async move { run_agent_side(&mut a, &token_clone).await });
			let verifier = NoAuthVerifier;
			let server = run_proxy_side(&mut b, &verifier).await.unwrap();
			agent.await.unwrap().unwrap();
			assert_eq!(server.agent_id.as_str(), token);
			assert_eq!(server.role, Role::Agent);
		}
	}

	#[tokio::test]
	async fn oversized_frame_is_rejected() {
		let (mut a, mut b) = tokio::io::duplex(64);
		a.write_u32(MAX_AUTH_MESSAGE_LENGTH + 1).await.unwrap();
		let verifier = NoAuthVerifier;
		let err = run_proxy_side(&mut b, &verifier).await.unwrap_err();
		assert!(matches!(err, AuthError::TooLarge(_)));
	}

	#[tokio::test]
	async fn empty_agent_id_is_rejected() {
		let (mut a, mut b) = tokio::io::duplex(1024);
		let agent = tokio::spawn(async move {
			let _ = write_frame(&mut a, b"").await;
		});
		let verifier = NoAuthVerifier;
		let err = run_proxy_side(&mut b, &verifier).await.unwrap_err();
		assert!(matches!(err, AuthError::Rejected(_)));
		agent.await.unwrap();
	}
}
