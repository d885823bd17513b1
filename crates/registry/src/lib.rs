//! `Registry` is the agent-id -> owning-proxy-endpoint map shared across a proxy fleet. It is
//! deliberately a thin interface: the real backend (memcached, redis, etcd, ...) lives outside
//! this crate. `InMemoryRegistry` is the single-proxy-deployment case; `NoneRegistry` is a no-op
//! used when no fleet-wide coordination is configured at all.

use std::sync::Arc;

use async_trait::async_trait;
use reverse_core::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("set and get difference for key {0}: wrote {1:?}, read back {2:?}")]
	SetGetMismatch(Strng, Strng, Strng),
	#[error("compare-and-swap failed for key {0}: expected {1:?}, found {2:?}")]
	CasMismatch(Strng, Strng, Option<Strng>),
	#[error("backend error: {0}")]
	Backend(#[from] anyhow::Error),
}

/// Pluggable key-value store mapping an `AgentID` to the `host:port` of the proxy that currently
/// owns it. Implementations must provide CAS semantics on `set` (when the key already exists) and
/// on `delete` (only remove if the stored value still matches what the caller expects).
#[async_trait]
pub trait Registry: Send + Sync + std::fmt::Debug {
	/// Returns the current value for `key`, or `None` if the key is absent. A missing key is not
	/// an error.
	async fn get(&self, key: &Strng) -> Result<Option<Strng>, RegistryError>;

	/// Writes `value` for `key`. If the key is absent, writes it and reads it back to verify the
	/// write landed; if present, performs a compare-and-swap replacing the existing value.
	async fn set(&self, key: &Strng, value: &Strng) -> Result<(), RegistryError>;

	/// Removes `key` if, and only if, its current value equals `expected`. A missing key is a
	/// no-op, not an error.
	async fn delete(&self, key: &Strng, expected: &Strng) -> Result<(), RegistryError>;

	/// Releases the backend connection, if any.
	async fn close(&self) {}
}

/// No-op registry for single-proxy deployments where no fleet-wide coordination is needed.
#[derive(Debug, Default, Clone)]
pub struct NoneRegistry;

#[async_trait]
impl Registry for NoneRegistry {
	async fn get(&self, _key: &Strng) -> Result<Option<Strng>, RegistryError> {
		Ok(None)
	}

	async fn set(&self, _key: &Strng, _value: &Strng) -> Result<(), RegistryError> {
		Ok(())
	}

	async fn delete(&self, _key: &Strng, _expected: &Strng) -> Result<(), RegistryError> {
		Ok(())
	}
}

/// An in-process registry, useful for single-proxy deployments that still want the CAS contract
/// enforced (and for tests standing in for a shared backend like memcached).
#[derive(Debug, Default, Clone)]
pub struct InMemoryRegistry {
	inner: Arc<flurry::HashMap<Strng, Strng>>,
}

impl InMemoryRegistry {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Registry for InMemoryRegistry {
	async fn get(&self, key: &Strng) -> Result<Option<Strng>, RegistryError> {
		let guard = self.inner.guard();
		Ok(self.inner.get(key, &guard).cloned())
	}

	async fn set(&self, key: &Strng, value: &Strng) -> Result<(), RegistryError> {
		let guard = self.inner.guard();
		match self.inner.try_insert(key.clone(), value.clone(), &guard) {
			Ok(_) => {
				// Read back to confirm the write landed, matching the distilled Registry contract.
				let read_back = self.inner.get(key, &guard).cloned();
				if read_back.as_ref() != Some(value) {
					return Err(RegistryError::SetGetMismatch(
						key.clone(),
						value.clone(),
						read_back.unwrap_or_else(|| strng::new("")),
					));
				}
				Ok(())
			},
			Err(_) => {
				// Key already present: replace unconditionally, matching a memcached CAS-on-replace.
				self.inner.insert(key.clone(), value.clone(), &guard);
				Ok(())
			},
		}
	}

	async fn delete(&self, key: &Strng, expected: &Strng) -> Result<(), RegistryError> {
		let guard = self.inner.guard();
		match self.inner.get(key, &guard) {
			None => Ok(()),
			Some(current) if current == expected => {
				self.inner.remove(key, &guard);
				Ok(())
			},
			Some(current) => Err(RegistryError::CasMismatch(
				key.clone(),
				expected.clone(),
				Some(current.clone()),
			)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn get_missing_key_is_empty_not_error() {
		let reg = InMemoryRegistry::new();
		assert_eq!(reg.get(&strng::new("a1")).await.unwrap(), None);
	}

	#[tokio::test]
	async fn set_then_get_roundtrips() {
		let reg = InMemoryRegistry::new();
		reg.set(&strng::new("a1"), &strng::new("proxy1:3128"))
			.await
			.unwrap();
		assert_eq!(
			reg.get(&strng::new("a1")).await.unwrap(),
			Some(strng::new("proxy1:3128"))
		);
	}

	#[tokio::test]
	async fn set_replaces_existing_value() {
		let reg = InMemoryRegistry::new();
		let key = strng::new("a1");
		reg.set(&key, &strng::new("proxy1:3128")).await.unwrap();
		reg.set(&key, &strng::new("proxy2:3128")).await.unwrap();
		assert_eq!(reg.get(&key).await.unwrap(), Some(strng::new("proxy2:3128")));
	}

	#[tokio::test]
	async fn delete_is_noop_on_missing_key() {
		let reg = InMemoryRegistry::new();
		reg.delete(&strng::new("a1"), &strng::new("proxy1:3128"))
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn delete_fails_on_value_mismatch() {
		let reg = InMemoryRegistry::new();
		let key = strng::new("a1");
		reg.set(&key, &strng::new("proxy1:3128")).await.unwrap();
		let err = reg.delete(&key, &strng::new("proxy2:3128")).await.unwrap_err();
		assert!(matches!(err, RegistryError::CasMismatch(..)));
		assert_eq!(reg.get(&key).await.unwrap(), Some(strng::new("proxy1:3128")));
	}

	#[tokio::test]
	async fn delete_removes_on_value_match() {
		let reg = InMemoryRegistry::new();
		let key = strng::new("a1");
		reg.set(&key, &strng::new("proxy1:3128")).await.unwrap();
		reg.delete(&key, &strng::new("proxy1:3128")).await.unwrap();
		assert_eq!(reg.get(&key).await.unwrap(), None);
	}

	#[tokio::test]
	async fn none_registry_always_reports_absent() {
		let reg = NoneRegistry;
		reg.set(&strng::new("a1"), &strng::new("proxy1:3128"))
			.await
			.unwrap();
		assert_eq!(reg.get(&strng::new("a1")).await.unwrap(), None);
	}
}
