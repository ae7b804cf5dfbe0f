//! Process-wide hooks for signals that have nowhere to go.
//!
//! An error reaching a subscriber with no error handler, an error arriving
//! after a terminal signal, and protocol violations are never swallowed: they
//! are logged and forwarded to every installed hook. Hooks are keyed so that
//! independent components can install and remove their own.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::{debug, error};

use crate::error::FluxError;

type ErrorHook = Arc<dyn Fn(&FluxError) + Send + Sync>;

static ON_ERROR_DROPPED: OnceLock<RwLock<HashMap<String, ErrorHook>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, ErrorHook>> {
    ON_ERROR_DROPPED.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Installs a hook under `key`, replacing a previous hook with the same key.
pub fn set_on_error_dropped<F>(key: impl Into<String>, hook: F)
where
    F: Fn(&FluxError) + Send + Sync + 'static,
{
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key.into(), Arc::new(hook));
}

/// Removes the hook installed under `key`.
pub fn reset_on_error_dropped(key: &str) {
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key);
}

/// Reports an error that no subscriber can receive.
pub(crate) fn on_error_dropped(err: &FluxError) {
    error!(error = %err, "error dropped");
    let hooks: Vec<ErrorHook> = registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect();
    for hook in hooks {
        hook(err);
    }
}

/// Reports an item discarded because its subscriber had no demand or was gone.
pub(crate) fn on_next_dropped(stage: &'static str) {
    debug!(stage, "item dropped");
}
