//! Bounded executor that runs request handlers on the shared runtime while
//! capping how many run concurrently.

use std::future::Future;
use std::sync::Arc;

use crate::server::OpResult;
use crate::utils::RelibankError;

use tokio::sync::Semaphore;

/// Worker pool wrapper around `tokio::spawn`. At most `pool_size` submitted
/// handlers run at once; further submissions wait for a free slot.
#[derive(Debug)]
pub struct RequestExecutor {
    /// Concurrency permits; one is held for a handler's whole run.
    permits: Arc<Semaphore>,

    /// Number of permits the pool started with.
    pool_size: usize,
}

impl RequestExecutor {
    /// Creates a pool allowing `pool_size` concurrent handlers.
    pub fn new(pool_size: usize) -> Result<Self, RelibankError> {
        if pool_size == 0 {
            return logged_err!("invalid pool_size {}", pool_size);
        }
        Ok(RequestExecutor {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        })
    }

    /// Maximum number of concurrently running handlers.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Runs one handler to completion on the pool and hands back its output.
    /// A handler that dies without finishing (e.g. panics) yields `Ok(None)`,
    /// the same as a dropped response. Submission to a shut-down pool is a
    /// hard error.
    ///
    /// The spawned handler keeps running even if this call's future gets
    /// dropped while waiting.
    pub async fn submit<F>(
        &self,
        handler: F,
    ) -> Result<Option<OpResult>, RelibankError>
    where
        F: Future<Output = Option<OpResult>> + Send + 'static,
    {
        let permit = self.permits.clone().acquire_owned().await?;
        let handle = tokio::spawn(async move {
            let _permit = permit; // held until the handler finishes
            handler.await
        });
        match handle.await {
            Ok(output) => Ok(output),
            Err(e) => {
                pf_warn!("request handler did not complete: {}", e);
                Ok(None)
            }
        }
    }

    /// Shuts the pool down; all later submissions fail.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}
