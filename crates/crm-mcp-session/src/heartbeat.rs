//! Background tasks: per-session heartbeat and the table-wide reaper.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use crm_mcp_core::SessionStream;
use tokio::{task::JoinHandle, time::Instant};

use crate::table::Shared;

/// Run the heartbeat for one active session.
///
/// The beat fires once `interval` has passed since the session's last
/// activity, so every touch re-arms it. A beat probes the stream: a connected
/// push channel touches the session, an idle one leaves it to expire, and a
/// failure marks it `Closing`. The task exits as soon as the session is gone,
/// replaced, or no longer active.
pub(crate) fn spawn_heartbeat<T: SessionStream>(
    shared: Weak<Shared<T>>,
    id: String,
    stream: Arc<T>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut deadline = Instant::now() + interval;
        loop {
            tokio::time::sleep_until(deadline).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };

            let Some(last_activity) = shared.active_last_activity(&id, &stream).await else {
                return;
            };
            let due = last_activity + interval;
            if due > Instant::now() {
                deadline = due;
                continue;
            }

            match stream.heartbeat().await {
                Ok(true) => shared.touch_if_owned(&id, &stream).await,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Heartbeat failed, closing session");
                    shared.mark_closing_if_owned(&id, &stream).await;
                    return;
                }
            }
            deadline = Instant::now() + interval;
        }
    })
}

/// Run `reap` on a fixed interval until the table is dropped.
pub(crate) fn spawn_reaper<T: SessionStream>(
    shared: Weak<Shared<T>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let reaped = shared.reap().await;
            if reaped > 0 {
                tracing::info!(reaped, "Reaper pass completed");
            } else {
                tracing::trace!("Reaper pass found nothing to reap");
            }
        }
    })
}
