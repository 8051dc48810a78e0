//! Lock-free live registry with atomic reload.
//!
//! [`LiveRegistry`] wraps [`arc_swap::ArcSwap`] so readers take a snapshot
//! once per command and never re-read it mid-call. [`reload()`](LiveRegistry::reload)
//! re-runs discovery through a [`RegistrySource`] and swaps the whole table
//! in one store.

use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;

use crate::{Registry, RegistryError};

/// Produces a fresh registry table. Implemented by the discovery step.
pub trait RegistrySource: Send + Sync {
    /// Run discovery and build a complete table.
    fn discover(&self) -> Result<Registry, RegistryError>;
}

impl<F> RegistrySource for F
where
    F: Fn() -> Result<Registry, RegistryError> + Send + Sync,
{
    fn discover(&self) -> Result<Registry, RegistryError> {
        self()
    }
}

/// A live, atomically swappable registry.
///
/// ```
/// use onecall_registry::{LiveRegistry, Registry};
/// let live = LiveRegistry::new(Registry::new());
/// let snapshot = live.current();
/// assert!(snapshot.is_empty());
/// ```
#[derive(Clone)]
pub struct LiveRegistry {
    inner: Arc<ArcSwap<Registry>>,
    source: Option<Arc<dyn RegistrySource>>,
}

impl LiveRegistry {
    /// Create a live registry with a fixed initial table and no discovery
    /// source.
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(registry)),
            source: None,
        }
    }

    /// Run discovery once and keep the source for later reloads.
    pub fn from_source(source: Arc<dyn RegistrySource>) -> Result<Self, RegistryError> {
        let registry = source.discover()?;
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(registry)),
            source: Some(source),
        })
    }

    /// Attach a discovery source, run it once and store the result.
    ///
    /// Handles obtained through [`downgrade()`](Self::downgrade) before this
    /// call observe the discovered table.
    pub fn with_source(mut self, source: Arc<dyn RegistrySource>) -> Result<Self, RegistryError> {
        self.inner.store(Arc::new(source.discover()?));
        self.source = Some(source);
        Ok(self)
    }

    /// A non-owning handle for capabilities that describe the registry
    /// they are registered in.
    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    /// Get a lock-free snapshot of the current table.
    pub fn current(&self) -> Arc<Registry> {
        self.inner.load_full()
    }

    /// Atomically replace the table.
    ///
    /// Readers holding an older `Arc<Registry>` are unaffected.
    pub fn replace(&self, registry: Registry) {
        self.inner.store(Arc::new(registry));
    }

    /// Re-run discovery and swap in the result.
    ///
    /// On failure the current table stays active and the error is returned.
    pub fn reload(&self) -> Result<Arc<Registry>, RegistryError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| RegistryError::Discovery("no discovery source configured".into()))?;
        let registry = Arc::new(source.discover()?);
        self.inner.store(registry.clone());
        tracing::info!(functions = registry.len(), "registry reloaded");
        Ok(registry)
    }
}

/// Non-owning handle to a [`LiveRegistry`] table.
#[derive(Clone)]
pub struct WeakRegistry(Weak<ArcSwap<Registry>>);

impl WeakRegistry {
    /// Snapshot of the current table, if the live registry still exists.
    pub fn current(&self) -> Option<Arc<Registry>> {
        self.0.upgrade().map(|inner| inner.load_full())
    }
}
