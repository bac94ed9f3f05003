use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serialises tests that read or mutate process environment variables, such as the
/// `${VAR}` expansion tests in `config`.
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
