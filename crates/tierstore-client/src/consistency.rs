//! Polling over eventually consistent listings
//!
//! Listings may keep showing deleted keys for a while. Callers that need an
//! exact count after deletes poll until the listing converges.

use crate::store::ObjectStore;
use std::time::{Duration, Instant};
use tierstore_common::{Error, Result};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Poll `list_objects(prefix)` until it reports `expected` objects
///
/// Returns the converged count, or an error naming the last observed count
/// once `timeout` elapses.
pub async fn wait_for_object_count(
    store: &dyn ObjectStore,
    prefix: &str,
    expected: usize,
    timeout: Duration,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;
    loop {
        let count = store.list_objects(prefix).await?.len();
        if count == expected {
            return Ok(count);
        }
        if Instant::now() >= deadline {
            return Err(Error::internal(format!(
                "listing of '{prefix}' did not converge to {expected} objects within {timeout:?} (last saw {count})"
            )));
        }
        debug!(
            "Listing of '{}' shows {} objects, waiting for {}",
            prefix, count, expected
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_converges_after_lag() {
        let store = MemoryStore::new("bucket");
        store.set_list_lag(3);
        for key in ["data/a", "data/b", "data/c"] {
            store.put_object(key, Bytes::from_static(b"x")).await.unwrap();
        }
        store.delete_object("data/a").await.unwrap();

        let count = wait_for_object_count(&store, "data/", 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_times_out() {
        let store = MemoryStore::new("bucket");
        store
            .put_object("data/a", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let result =
            wait_for_object_count(&store, "data/", 0, Duration::from_millis(50)).await;
        assert!(result.is_err());
    }
}
