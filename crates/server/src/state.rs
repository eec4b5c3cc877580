use std::sync::Arc;

use cartograph_core::Config;
use cartograph_targets::TargetStore;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub targets: Arc<TargetStore>,
    pub config: Config,
}
