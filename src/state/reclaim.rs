/// Background reclamation of expired entries
///
/// The in-memory state store and the recent-event buffer only drop an expired
/// entry lazily, when that execution is read again. The reclaimer purges both
/// on a fixed interval so finished executions do not accumulate for the life
/// of the process.

use crate::events::{RecentEventBuffer, SweeperHandle};
use crate::state::ExecutionStateStore;
use std::sync::Arc;
use std::time::Duration;

/// Start purging `store` and `buffer` every `interval`
pub fn spawn_reclaimer(
    interval: Duration,
    store: Arc<dyn ExecutionStateStore>,
    buffer: Arc<RecentEventBuffer>,
) -> SweeperHandle {
    tracing::debug!("♻️ Reclaiming expired state and events every {:?}", interval);

    SweeperHandle::spawn(interval, move || {
        let store = Arc::clone(&store);
        let buffer = Arc::clone(&buffer);
        async move {
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!("♻️ Reclaimed {} expired execution state(s)", removed),
                Err(e) => tracing::warn!("⚠️ State reclamation failed: {}", e),
            }
            let events = buffer.purge_expired();
            if events > 0 {
                tracing::debug!("♻️ Reclaimed {} expired buffered event(s)", events);
            }
        }
    })
}
