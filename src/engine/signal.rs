//! Cooperative stop request shared between the controller and the engine.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

const RUNNING: u8 = 0;
const GRACEFUL: u8 = 1;
const FORCED: u8 = 2;

/// Stop flag the engine checks between events.
///
/// A graceful stop lets the engine hand out deliveries that are already due
/// before tearing down. A forced stop discards them.
#[derive(Debug, Default)]
pub struct StopSignal {
    level: AtomicU8,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.level.fetch_max(GRACEFUL, Ordering::AcqRel);
        self.notify.notify_one();
    }

    pub fn force(&self) {
        self.level.store(FORCED, Ordering::Release);
        self.notify.notify_one();
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.level.load(Ordering::Acquire) != RUNNING
    }

    #[inline]
    pub fn is_forced(&self) -> bool {
        self.level.load(Ordering::Acquire) == FORCED
    }

    /// Resolves once `request` or `force` is called. A call made before
    /// anyone waits is not lost.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}
