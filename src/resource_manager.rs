//! Resource management

use crate::error::DmrppError;

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// [crate::resource_manager::ResourceManager] bounds the resources used by partial reads.
///
/// Each resource is an optional Tokio Semaphore. Permits are owned so that they can move into
/// spawned fetch and decode tasks.
#[derive(Debug, Default)]
pub struct ResourceManager {
    /// Optional semaphore for concurrent byte range fetches.
    fetch_connections: Option<Arc<Semaphore>>,

    /// Optional semaphore for memory (bytes).
    memory: Option<Arc<Semaphore>>,

    /// Optional total memory pool in bytes.
    total_memory: Option<usize>,

    /// Optional semaphore for tasks.
    tasks: Option<Arc<Semaphore>>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    ///
    /// # Arguments
    ///
    /// * `fetch_connection_limit`: Optional limit on concurrent byte range fetches
    /// * `memory_limit`: Optional limit on bytes held by fetched chunks
    /// * `task_limit`: Optional limit on concurrent chunk tasks
    pub fn new(
        fetch_connection_limit: Option<usize>,
        memory_limit: Option<usize>,
        task_limit: Option<usize>,
    ) -> Self {
        let semaphore = |permits: usize| Arc::new(Semaphore::new(permits));
        Self {
            fetch_connections: fetch_connection_limit.map(semaphore),
            memory: memory_limit.map(semaphore),
            total_memory: memory_limit,
            tasks: task_limit.map(semaphore),
        }
    }

    /// Acquire a fetch connection resource.
    pub async fn fetch_connection(&self) -> Result<Option<OwnedSemaphorePermit>, DmrppError> {
        optional_acquire(&self.fetch_connections, 1).await
    }

    /// Acquire memory resource.
    ///
    /// # Arguments
    ///
    /// * `bytes`: Number of bytes to reserve
    pub async fn memory(&self, bytes: usize) -> Result<Option<OwnedSemaphorePermit>, DmrppError> {
        self.check_memory(bytes)?;
        optional_acquire(&self.memory, bytes).await
    }

    /// Fail if a request for `bytes` could never be satisfied.
    ///
    /// # Arguments
    ///
    /// * `bytes`: Number of bytes
    pub fn check_memory(&self, bytes: usize) -> Result<(), DmrppError> {
        match self.total_memory {
            Some(total_memory) if bytes > total_memory => Err(DmrppError::InsufficientMemory {
                requested: bytes,
                total: total_memory,
            }),
            _ => Ok(()),
        }
    }

    /// Returns the memory pool size in bytes, if limited.
    pub fn total_memory(&self) -> Option<usize> {
        self.total_memory
    }

    /// Acquire a task resource.
    pub async fn task(&self) -> Result<Option<OwnedSemaphorePermit>, DmrppError> {
        optional_acquire(&self.tasks, 1).await
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Arc<Semaphore>>,
    n: usize,
) -> Result<Option<OwnedSemaphorePermit>, DmrppError> {
    let n = n.try_into()?;
    match sem {
        Some(sem) => Ok(Some(sem.clone().acquire_many_owned(n).await?)),
        None => Ok(None),
    }
}
