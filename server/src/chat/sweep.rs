//! Background cleanup of users that have gone quiet.
//!
//! Open sessions refresh their last-seen timestamp on a short interval, so
//! only users without a live connection ever fall behind the cutoff.

use chrono::Duration;

use crate::store::{run_blocking, Store, StoreError};

/// Spawn a background task that deletes inactive users every `every`.
///
/// The first pass runs one interval after startup.
pub fn spawn_inactive_user_sweep(store: Store, older_than: Duration, every: std::time::Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;

            match sweep_once(&store, older_than).await {
                Ok(count) if count > 0 => {
                    tracing::info!("Inactive user sweep: removed {} users", count);
                }
                Ok(_) => {
                    tracing::debug!("Inactive user sweep: nothing to remove");
                }
                Err(e) => {
                    tracing::error!("Inactive user sweep error: {}", e);
                }
            }
        }
    });
}

/// One sweep pass. Returns how many users were deleted.
pub async fn sweep_once(store: &Store, older_than: Duration) -> Result<usize, StoreError> {
    run_blocking(store, move |s| s.delete_inactive_users(older_than)).await
}
