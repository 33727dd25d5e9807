//! The shared engine handle and its periodic sweep task.

use mqtt3_protocol::persistence::Persistence;
use mqtt3_protocol::sink::MessageSink;
use mqtt3_protocol::transport::Transport;
use mqtt3_protocol::SessionEngine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// One lock around the whole engine. The packet readers, the transport
/// flushers and the sweep task all serialize through it.
pub type SharedEngine<T, P, S> = Arc<Mutex<SessionEngine<T, P, S>>>;

/// Wall-clock `Instant` as the engine sees it. Follows tokio's clock, so
/// paused-time tests move it too.
pub(crate) fn now() -> std::time::Instant {
    Instant::now().into_std()
}

#[must_use]
pub fn shared<T, P, S>(engine: SessionEngine<T, P, S>) -> SharedEngine<T, P, S> {
    Arc::new(Mutex::new(engine))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// How often keep-alive is checked.
    pub tick: Duration,
    /// How often a tick also runs the retry pass.
    pub retry_every: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            retry_every: Duration::from_secs(5),
        }
    }
}

/// Runs `sweep` on every tick until the engine is dropped.
///
/// The task only holds a weak reference, so dropping the last
/// `SharedEngine` ends it.
pub fn spawn_sweep<T, P, S>(engine: &SharedEngine<T, P, S>, settings: SweepSettings) -> JoinHandle<()>
where
    T: Transport + 'static,
    P: Persistence + 'static,
    S: MessageSink + 'static,
{
    let engine = Arc::downgrade(engine);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        let mut last_retry = Instant::now();

        loop {
            interval.tick().await;
            let Some(engine) = engine.upgrade() else {
                break;
            };

            let now = Instant::now();
            let do_retry = now.duration_since(last_retry) >= settings.retry_every;
            if do_retry {
                last_retry = now;
            }
            let report = engine.lock().sweep(now.into_std(), do_retry);
            if report.sessions_closed > 0 {
                info!(closed = report.sessions_closed, "Sweep closed failed sessions");
            }
            if report.pings_sent > 0 || report.messages_retried > 0 {
                debug!(
                    pings = report.pings_sent,
                    retried = report.messages_retried,
                    "Sweep pass"
                );
            }
        }
        debug!("Sweep task stopped");
    })
}
