use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::NetError;

static ACTIVE: AtomicUsize = AtomicUsize::new(0);

/// Reference-counted guard bracketing all transport use.
///
/// Hosts may only be constructed while at least one guard is live, and must
/// be dropped before the last guard is. Independent call sites may each
/// hold their own guard; teardown happens when the last one drops.
#[derive(Debug)]
pub struct Runtime {
    _priv: (),
}

impl Runtime {
    pub fn init() -> Self {
        let previous = ACTIVE.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            log::debug!("transport runtime initialized");
        }
        Self { _priv: () }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let previous = ACTIVE.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            log::debug!("transport runtime deinitialized");
        }
    }
}

pub(crate) fn ensure_initialized() -> Result<(), NetError> {
    if ACTIVE.load(Ordering::SeqCst) == 0 {
        return Err(NetError::NotInitialized);
    }
    Ok(())
}
