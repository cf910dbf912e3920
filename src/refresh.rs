//! Unified refresh loop for the session snapshot.
//!
//! Two trigger sources feed one cycle: a periodic timer and a change
//! notification fired when the upstream automation posts /api/refresh.
//! Both run the identical fetch -> normalize -> group -> replace sequence,
//! so the transform is invoked uniformly regardless of trigger origin.
//!
//! A failed fetch logs a warning and keeps the previous snapshot; the
//! transform itself never fails.

use crate::normalize::{group_rows, NormalizeOptions, RawRow};
use crate::provider::TableClient;
use crate::sessions::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Shared trigger for on-demand refresh
pub fn create_trigger() -> Arc<Notify> {
    Arc::new(Notify::new())
}

/// Run one fetch-and-replace cycle
async fn run_cycle(store: &Arc<SessionStore>, client: &TableClient, opts: &NormalizeOptions) {
    match client.fetch_rows().await {
        Ok(rows) => {
            let total = rows.len();
            let groups = group_rows(&rows, opts);
            debug!("Refreshed snapshot: {} rows in {} sessions", total, groups.len());
            store.replace(groups, total).await;
        }
        Err(e) => {
            warn!("Row fetch failed, keeping previous snapshot: {}", e);
        }
    }
}

/// Start the refresh loop
pub async fn start(
    store: Arc<SessionStore>,
    client: TableClient,
    opts: NormalizeOptions,
    trigger: Arc<Notify>,
    poll_interval: Duration,
) {
    info!("Starting refresh loop (poll every {}s)", poll_interval.as_secs());

    // Initial snapshot before the first tick
    run_cycle(&store, &client, &opts).await;

    loop {
        tokio::select! {
            // Change notification from the upstream automation
            _ = trigger.notified() => {
                debug!("Refresh triggered by change notification");
                run_cycle(&store, &client, &opts).await;
            }
            // Periodic fallback poll
            _ = tokio::time::sleep(poll_interval) => {
                run_cycle(&store, &client, &opts).await;
            }
        }
    }
}

/// Canned rows served when no provider is configured, so the dashboard
/// stays browsable in local development
pub fn demo_rows() -> Vec<RawRow> {
    let raw = serde_json::json!([
        {"id": 1, "session_id": "session_001", "message": "Hello, how can I help you?"},
        {"id": 2, "session_id": "session_001", "message": "I would like to book an appointment."},
        {"id": 3, "session_id": "session_002", "message": {"content": "Could I get pricing information?"}},
        {"id": 4, "session_id": "session_003", "message": "Thanks!"}
    ]);
    serde_json::from_value(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_rows_group_cleanly() {
        let rows = demo_rows();
        assert_eq!(rows.len(), 4);

        let groups = group_rows(&rows, &NormalizeOptions::default());
        assert_eq!(groups.len(), 3);
        // session_003 holds the most recent row (id 4)
        assert_eq!(groups[0].session_id, "session_003");
        assert_eq!(
            groups[2].messages[0].text,
            "Hello, how can I help you?"
        );
    }
}
