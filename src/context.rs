use crate::build::{ArtifactLayout, TimestampManager};
use crate::error::PoolError;
use crate::sync::{ConversionPool, DirectorySync};
use crate::utils::Config;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Process-wide state built once at startup and handed to every component.
///
/// The conversion pool is only spawned the first time a sync needs it.
pub struct Context {
    config: Arc<Config>,
    interrupted: Arc<AtomicBool>,
    pool: Mutex<Option<Arc<ConversionPool>>>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            interrupted: Arc::new(AtomicBool::new(false)),
            pool: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(self.config.build_root.clone())
    }

    pub fn timestamp_manager(&self) -> TimestampManager {
        TimestampManager::new(&self.config.git_root, self.layout())
    }

    /// The shared pool, created on first use. A pool shut down by an
    /// interrupted sync is replaced.
    pub fn pool(&self) -> Result<Arc<ConversionPool>, PoolError> {
        let mut slot = self.pool.lock();
        if let Some(pool) = slot.as_ref() {
            if !pool.is_shut_down() {
                return Ok(pool.clone());
            }
        }
        let pool = Arc::new(ConversionPool::new(self.config.sync_workers)?);
        info!("Started conversion pool with {} workers", pool.num_workers());
        *slot = Some(pool.clone());
        Ok(pool)
    }

    pub fn directory_sync(&self) -> Result<DirectorySync, PoolError> {
        let sync = DirectorySync::new(self.pool()?, self.interrupted.clone());
        Ok(if self.config.persist_source_timestamp {
            sync.with_source_timestamps(self.timestamp_manager())
        } else {
            sync
        })
    }

    /// Ask in-flight syncs to stop. They cancel their pending work and return `Interrupted`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().take() {
            info!("Shutting down conversion pool");
            pool.shutdown();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            sync_workers: 2,
            ..Config::default()
        }
    }

    #[test]
    fn pool_is_lazy_and_shared() {
        let ctx = Context::new(config());
        assert!(ctx.pool.lock().is_none());
        let a = ctx.pool().unwrap();
        let b = ctx.pool().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.num_workers(), 2);
    }

    #[test]
    fn shut_down_pool_is_rebuilt() {
        let ctx = Context::new(config());
        let first = ctx.pool().unwrap();
        first.shutdown();
        let second = ctx.pool().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_shut_down());

        ctx.shutdown();
        assert!(second.is_shut_down());
    }

    #[test]
    fn interrupt_flag_round_trips() {
        let ctx = Context::new(config());
        assert!(!ctx.is_interrupted());
        ctx.interrupt();
        assert!(ctx.is_interrupted());
        ctx.clear_interrupt();
        assert!(!ctx.is_interrupted());
    }
}
