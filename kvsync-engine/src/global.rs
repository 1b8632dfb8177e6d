//! Process-wide engine instance.
//!
//! Applications that cannot thread an engine through every consumer install
//! one here at startup and remove it at teardown.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use tracing::info;

use crate::engine::SyncEngine;

static GLOBAL: Lazy<RwLock<Option<SyncEngine>>> = Lazy::new(|| RwLock::new(None));

/// Install `engine` as the process-wide engine.
///
/// Returns the engine it replaces, if any.
pub fn install(engine: SyncEngine) -> Option<SyncEngine> {
    let tab_id = engine.tab_id();
    let previous = match GLOBAL.write() {
        Ok(mut slot) => slot.replace(engine),
        Err(poisoned) => poisoned.into_inner().replace(engine),
    };
    info!(tab_id = %tab_id, replaced = previous.is_some(), "Installed global sync engine");
    previous
}

/// The process-wide engine, if one is installed.
pub fn global() -> Option<SyncEngine> {
    match GLOBAL.read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Remove the process-wide engine and hand it back, e.g. to flush it.
pub fn uninstall() -> Option<SyncEngine> {
    let previous = match GLOBAL.write() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if previous.is_some() {
        info!("Uninstalled global sync engine");
    }
    previous
}
