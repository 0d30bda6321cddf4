//! Process-wide default coordinator
//!
//! The first coordinator made through `make_coordinator` becomes the default
//! that pools use when they are not handed one explicitly.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::coord::coordinator::Coordinator;
use crate::core::config::ClusterConfig;
use crate::core::errors::{PoolError, Result};

/// Holder of the default coordinator
#[derive(Clone)]
pub struct CoordinatorRegistry {
    default: Arc<RwLock<Option<Arc<Coordinator>>>>,
}

lazy_static::lazy_static! {
    static ref GLOBAL_COORDINATORS: CoordinatorRegistry = CoordinatorRegistry::new();
}

impl CoordinatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            default: Arc::new(RwLock::new(None)),
        }
    }

    /// The process-wide registry
    pub fn global() -> CoordinatorRegistry {
        GLOBAL_COORDINATORS.clone()
    }

    /// Offer `coordinator` as the default. The first one wins; a closed
    /// default is replaced. Returns whether it was installed.
    pub fn set_default(&self, coordinator: Arc<Coordinator>) -> bool {
        let mut default = self.default.write();
        match default.as_ref() {
            Some(current) if !current.is_closed() => false,
            _ => {
                *default = Some(coordinator);
                true
            }
        }
    }

    /// The default coordinator
    pub fn current(&self) -> Result<Arc<Coordinator>> {
        self.default.read().clone().ok_or_else(|| {
            PoolError::state("coordinator", "make_coordinator() has not been called yet")
        })
    }

    /// Forget the default, returning it
    pub fn reset(&self) -> Option<Arc<Coordinator>> {
        self.default.write().take()
    }

    pub fn has_default(&self) -> bool {
        self.default.read().is_some()
    }
}

impl Default for CoordinatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind a coordinator and offer it to `registry` as the default
pub async fn make_coordinator_in(
    registry: &CoordinatorRegistry,
    config: &ClusterConfig,
) -> Result<Arc<Coordinator>> {
    let coordinator = Coordinator::bind_with(config).await?;
    if registry.set_default(coordinator.clone()) {
        info!(coordinator = %coordinator.id(), "default coordinator set");
    } else {
        debug!(coordinator = %coordinator.id(), "default coordinator already set");
    }
    Ok(coordinator)
}

/// Bind a coordinator; the first one made in this process becomes the default
pub async fn make_coordinator(config: &ClusterConfig) -> Result<Arc<Coordinator>> {
    make_coordinator_in(&CoordinatorRegistry::global(), config).await
}

/// The process-wide default coordinator
pub fn default_coordinator() -> Result<Arc<Coordinator>> {
    CoordinatorRegistry::global().current()
}
