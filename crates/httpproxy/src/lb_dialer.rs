use std::sync::Arc;

use async_trait::async_trait;
use reverse_core::prelude::*;
use reverse_registry::Registry;

use crate::dialer::{BoxedUpstream, DialContext, RawDialer, TcpUpstream};

/// Looks up the agent in the shared [`Registry`] and opens a TCP connection to the proxy that
/// currently owns it. Stateless: every call re-resolves the registry, so a proxy failover is
/// picked up on the next request with no LB-side bookkeeping.
#[derive(Clone)]
pub struct LoadBalancerDialer {
	registry: Arc<dyn Registry>,
}

impl std::fmt::Debug for LoadBalancerDialer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LoadBalancerDialer").finish()
	}
}

impl LoadBalancerDialer {
	pub fn new(registry: Arc<dyn Registry>) -> Self {
		Self { registry }
	}
}

#[async_trait]
impl RawDialer for LoadBalancerDialer {
	async fn dial_raw(&self, ctx: &DialContext, _target: &str) -> anyhow::Result<BoxedUpstream> {
		let agent_id = &ctx.client_id;
		let addr = self
			.registry
			.get(agent_id)
			.await?
			.ok_or_else(|| anyhow::anyhow!("no registry entry for agent {agent_id}"))?;
		if addr.is_empty() {
			anyhow::bail!("empty registry entry for agent {agent_id}");
		}
		let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
		stream.set_nodelay(true)?;
		let local = stream.local_addr()?;
		let remote = stream.peer_addr()?;
		Ok(Box::new(TcpUpstream {
			stream,
			local,
			remote,
		}))
	}
}
