// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::time::Duration;

pub use internal::{
	DrainMode, ReleaseShutdown as DrainBlocker, Signal as DrainTrigger, Watch as DrainWatcher,
};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

/// Constructs a new drain pair.
/// * `DrainTrigger` starts a drain and waits for it to complete.
/// * `DrainWatcher` should be held by anything participating in the drain. It can be cloned, and
///   a drain will not complete until every outstanding watcher is dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (tx, rx) = internal::channel();
	(tx, rx)
}

/// Runs a future with graceful shutdown support. The supplied closure receives a `DrainWatcher`
/// (hold it to mark the task active; watch it to learn when to start winding down) and a
/// `force_shutdown` receiver that fires once the graceful deadline has elapsed.
pub async fn run_with_drain<F, O>(
	component: String,
	drain: DrainWatcher,
	deadline: Duration,
	make_future: F,
) where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let (trigger_force_shutdown, force_shutdown) = watch::channel(());
	let trigger_force_shutdown_cpy = trigger_force_shutdown.clone();
	let fut = make_future(sub_drain, force_shutdown).in_current_span();
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(
				component,
				"drain started, waiting {:?} for any connections to complete", deadline
			);
			if tokio::time::timeout(
				deadline,
				sub_drain_signal.start_drain_and_wait(DrainMode::Graceful),
			)
			.await
			.is_err()
			{
				warn!(
					component,
					"drain duration expired with pending connections, forcefully shutting down"
				);
			}
		} else {
			debug!(component, "terminating");
		}
		let _ = trigger_force_shutdown.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = trigger_force_shutdown_cpy.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);

		let signal = Signal {
			drained_rx,
			signal_tx,
		};
		let watch = Watch {
			drained_tx,
			signal_rx,
		};
		(signal, watch)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Sends a drain command to all watchers.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	impl Signal {
		/// Starts a drain and waits for every outstanding `Watch` to be dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			// Every Watch holds a clone of drained_tx; once all are dropped the channel closes.
			while self.drained_rx.recv().await.is_some() {}
		}
	}

	/// Watches for a drain command. Cloning bumps the outstanding-watcher count.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	impl Watch {
		/// Resolves once a drain has been signaled, yielding the requested mode.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			loop {
				if let Some(mode) = *self.signal_rx.borrow() {
					return ReleaseShutdown(mode);
				}
				if self.signal_rx.changed().await.is_err() {
					return ReleaseShutdown(DrainMode::Graceful);
				}
			}
		}
	}

	/// Held by a task that is actively participating in a drain; dropping it unblocks the
	/// matching `Signal::start_drain_and_wait`.
	pub struct ReleaseShutdown(DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.0
		}
	}
}
