//! Per-proxy table of live agent connections. Guarantees "at most one live connection per
//! AgentID" under arbitrary interleaving of connect/disconnect/supersede by routing every mutation
//! through `flurry`'s atomic per-key compute operations rather than a coarse lock.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reverse_core::prelude::*;
use reverse_registry::Registry;

/// Stable-for-lifetime identifier for one QUIC connection, assigned locally on accept.
pub type ConnectionId = u64;

/// A QUIC connection as `ConnTrack` needs to see it: open a stream toward the agent, and close
/// with an application-level reason when superseded or shut down.
#[async_trait]
pub trait AgentConnection: Send + Sync + Debug {
	fn id(&self) -> ConnectionId;
	async fn open_bi(&self) -> anyhow::Result<crate::dialer::AgentStream>;
	async fn close(&self, code: u32, reason: &str);
}

fn next_connection_id() -> ConnectionId {
	static COUNTER: AtomicU64 = AtomicU64::new(1);
	COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Mints sequential [`ConnectionId`]s; exposed so `AgentServer` can assign one per accepted
/// transport before registering it with `ConnTrack`.
pub fn allocate_connection_id() -> ConnectionId {
	next_connection_id()
}

pub struct ConnTrack {
	tracked: flurry::HashMap<ConnectionId, Strng>,
	live: flurry::HashMap<Strng, Arc<dyn AgentConnection>>,
	registry: Arc<dyn Registry>,
	proxy_endpoint: Strng,
}

impl ConnTrack {
	pub fn new(registry: Arc<dyn Registry>, proxy_endpoint: Strng) -> Self {
		Self {
			tracked: flurry::HashMap::new(),
			live: flurry::HashMap::new(),
			registry,
			proxy_endpoint,
		}
	}

	/// Registers a transport-level connection before authentication completes.
	pub fn on_started(&self, conn_id: ConnectionId) {
		let guard = self.tracked.guard();
		self.tracked.try_insert(conn_id, strng::new(""), &guard).ok();
	}

	/// Called when the transport underneath `conn_id` has closed, authenticated or not.
	pub async fn on_closed(&self, conn_id: ConnectionId) {
		let agent_id = {
			let guard = self.tracked.guard();
			self.tracked.remove(&conn_id, &guard).cloned()
		};
		let Some(agent_id) = agent_id else { return };
		if agent_id.is_empty() {
			return;
		}

		// `compute_if_present`'s return value can't distinguish "removed" from "was already
		// absent", so track whether our closure actually ran and matched this connection.
		let evicted = std::sync::atomic::AtomicBool::new(false);
		{
			let guard = self.live.guard();
			self.live.compute_if_present(
				&agent_id,
				|_, conn| {
					if conn.id() == conn_id {
						evicted.store(true, Ordering::SeqCst);
						None
					} else {
						Some(conn.clone())
					}
				},
				&guard,
			);
		}
		if evicted.load(Ordering::SeqCst) {
			if let Err(e) = self.registry.delete(&agent_id, &self.proxy_endpoint).await {
				debug!(%agent_id, error = %e, "registry delete failed on connection close");
			}
		}
	}

	/// Associates a freshly authenticated connection with `agent_id`. Closes any connection it
	/// supersedes. On Registry rejection, closes the new connection too rather than leaving an
	/// orphan the Registry doesn't know about.
	pub async fn put(&self, agent_id: Strng, conn: Arc<dyn AgentConnection>) -> anyhow::Result<()> {
		let conn_id = conn.id();
		{
			let guard = self.tracked.guard();
			self
				.tracked
				.compute_if_present(&conn_id, |_, cur| if cur.is_empty() { Some(agent_id.clone()) } else { Some(cur.clone()) }, &guard);
		}

		let previous = {
			let guard = self.live.guard();
			self.live.insert(agent_id.clone(), conn.clone(), &guard).cloned()
		};
		if let Some(prev) = previous {
			prev.close(409, "closing old connection").await;
		}

		if let Err(e) = self.registry.set(&agent_id, &self.proxy_endpoint).await {
			conn.close(500, "registry rejected this agent").await;
			let guard = self.live.guard();
			self.live.compute_if_present(&agent_id, |_, cur| if cur.id() == conn_id { None } else { Some(cur.clone()) }, &guard);
			return Err(e.into());
		}
		Ok(())
	}

	pub fn get(&self, agent_id: &Strng) -> Option<Arc<dyn AgentConnection>> {
		let guard = self.live.guard();
		self.live.get(agent_id, &guard).cloned()
	}

	/// Closes every live connection with application code 0. Used during drain.
	pub async fn shutdown(&self) {
		let conns: Vec<Arc<dyn AgentConnection>> = {
			let guard = self.live.guard();
			self.live.values(&guard).cloned().collect()
		};
		for conn in conns {
			conn.close(0, "shutting down").await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicBool;
	use tokio::sync::Mutex as TMutex;

	#[derive(Debug)]
	struct FakeConn {
		id: ConnectionId,
		closed: Arc<AtomicBool>,
		close_reason: Arc<TMutex<Option<(u32, String)>>>,
	}

	#[async_trait]
	impl AgentConnection for FakeConn {
		fn id(&self) -> ConnectionId {
			self.id
		}
		async fn open_bi(&self) -> anyhow::Result<crate::dialer::AgentStream> {
			anyhow::bail!("not used in these tests")
		}
		async fn close(&self, code: u32, reason: &str) {
			self.closed.store(true, Ordering::SeqCst);
			*self.close_reason.lock().await = Some((code, reason.to_string()));
		}
	}

	fn fake(id: ConnectionId) -> (Arc<dyn AgentConnection>, Arc<AtomicBool>, Arc<TMutex<Option<(u32, String)>>>) {
		let closed = Arc::new(AtomicBool::new(false));
		let close_reason = Arc::new(TMutex::new(None));
		(
			Arc::new(FakeConn {
				id,
				closed: closed.clone(),
				close_reason: close_reason.clone(),
			}),
			closed,
			close_reason,
		)
	}

	#[tokio::test]
	async fn put_then_get_roundtrips() {
		let registry = Arc::new(reverse_registry::InMemoryRegistry::new());
		let track = ConnTrack::new(registry, strng::new("proxy:1"));
		let (conn, _closed, _reason) = fake(1);
		track.on_started(1);
		track.put(strng::new("agent-a"), conn.clone()).await.unwrap();
		let found = track.get(&strng::new("agent-a")).unwrap();
		assert_eq!(found.id(), 1);
	}

	#[tokio::test]
	async fn supersede_closes_predecessor() {
		let registry = Arc::new(reverse_registry::InMemoryRegistry::new());
		let track = ConnTrack::new(registry, strng::new("proxy:1"));
		let (conn1, closed1, reason1) = fake(1);
		let (conn2, _closed2, _reason2) = fake(2);
		track.on_started(1);
		track.on_started(2);
		track.put(strng::new("agent-a"), conn1).await.unwrap();
		track.put(strng::new("agent-a"), conn2.clone()).await.unwrap();
		assert!(closed1.load(Ordering::SeqCst));
		assert_eq!(reason1.lock().await.as_ref().unwrap().0, 409);
		assert_eq!(track.get(&strng::new("agent-a")).unwrap().id(), 2);
	}

	#[tokio::test]
	async fn on_closed_for_stale_conn_is_a_noop() {
		let registry = Arc::new(reverse_registry::InMemoryRegistry::new());
		let track = ConnTrack::new(registry, strng::new("proxy:1"));
		let (conn1, _closed1, _reason1) = fake(1);
		let (conn2, _closed2, _reason2) = fake(2);
		track.on_started(1);
		track.on_started(2);
		track.put(strng::new("agent-a"), conn1).await.unwrap();
		track.put(strng::new("agent-a"), conn2).await.unwrap();
		// conn1 (id 1) was superseded; its close callback firing afterward must not evict conn2.
		track.on_closed(1).await;
		assert_eq!(track.get(&strng::new("agent-a")).unwrap().id(), 2);
	}

	#[tokio::test]
	async fn on_closed_for_current_owner_evicts_it() {
		let registry = Arc::new(reverse_registry::InMemoryRegistry::new());
		let track = ConnTrack::new(registry, strng::new("proxy:1"));
		let (conn1, _closed1, _reason1) = fake(1);
		track.on_started(1);
		track.put(strng::new("agent-a"), conn1).await.unwrap();
		track.on_closed(1).await;
		assert!(track.get(&strng::new("agent-a")).is_none());
	}
}
