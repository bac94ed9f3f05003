//! Shutdown requests from signals or callers.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::{info, warn};

/// Shared flag observed by the supervisor loop. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Returns `true` only for the first request.
    pub fn request(&self) -> bool {
        !self.requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Routes SIGINT and SIGTERM into `token`. Repeated signals are logged and otherwise ignored.
pub fn install_signal_handler(token: ShutdownToken) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if token.request() {
            info!("Received termination signal; shutting down");
        } else {
            warn!("Shutdown already in progress");
        }
    })
}
