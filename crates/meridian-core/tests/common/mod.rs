//! Shared fixtures for endpoint integration tests.

use std::sync::Arc;

use meridian_core::testing::SimpleEventBus;
use meridian_core::{CoreConfig, CoreContext, CoreEnvironment};

/// Builds a collecting bus and a core context wired to it.
pub fn harness() -> (Arc<SimpleEventBus>, CoreContext) {
    harness_with_config(CoreConfig::default())
}

/// Like [`harness`] with an explicit configuration.
pub fn harness_with_config(config: CoreConfig) -> (Arc<SimpleEventBus>, CoreContext) {
    let bus = Arc::new(SimpleEventBus::new());
    let env = CoreEnvironment::new(config, bus.clone());
    (bus, CoreContext::new(env))
}
