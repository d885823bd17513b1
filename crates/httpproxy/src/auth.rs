//! Client-facing `Proxy-Authorization: Basic` authentication, distinct from the QUIC-side
//! `AuthFlow` token handshake used between agent and proxy.

use std::collections::HashSet;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use reverse_core::prelude::*;
use serde_json::{Map, Value};

/// `authenticate(user, pass) -> Some(clientID)` on success, `None` on rejection.
pub trait ClientAuthenticator: Send + Sync + std::fmt::Debug {
	fn authenticate(&self, user: &str, pass: &str) -> Option<Strng>;
}

#[derive(Debug, Default, Clone)]
pub struct NoAuthClientAuthenticator;

impl ClientAuthenticator for NoAuthClientAuthenticator {
	fn authenticate(&self, user: &str, _pass: &str) -> Option<Strng> {
		if user.is_empty() {
			None
		} else {
			Some(strng::new(user))
		}
	}
}

/// Verifies `pass` as a JWT asserting `claims.agentID == user` and `claims.role == "client"`.
#[derive(Clone)]
pub struct JwtClientAuthenticator {
	pub decoding_key: DecodingKey,
	pub algorithm: Algorithm,
	pub audience: Option<HashSet<String>>,
}

impl std::fmt::Debug for JwtClientAuthenticator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("JwtClientAuthenticator")
			.field("algorithm", &self.algorithm)
			.field("audience", &self.audience)
			.finish()
	}
}

impl ClientAuthenticator for JwtClientAuthenticator {
	fn authenticate(&self, user: &str, pass: &str) -> Option<Strng> {
		let mut validation = Validation::new(self.algorithm);
		validation.leeway = 5;
		if let Some(aud) = &self.audience {
			validation.aud = Some(aud.clone());
		} else {
			validation.validate_aud = false;
		}
		let data = decode::<Map<String, Value>>(pass, &self.decoding_key, &validation).ok()?;
		let role = data.claims.get("role")?.as_str()?;
		let agent_id = data.claims.get("agentID")?.as_str()?;
		if role != "client" || agent_id != user {
			return None;
		}
		Some(strng::new(agent_id))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn no_auth_requires_nonempty_user() {
		let a = NoAuthClientAuthenticator;
		assert_eq!(a.authenticate("a1", "ignored"), Some(strng::new("a1")));
		assert_eq!(a.authenticate("", "ignored"), None);
	}
}
