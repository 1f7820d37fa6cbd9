//! Logging host function implementation.
//!
//! Guest modules running inside a worker log through `env::log`. Entries
//! are kept on the [`WorkerContext`] and re-emitted through `tracing`
//! tagged with the worker id.

use tracing::{debug, error, info, warn};
use wasm_handoff_core::store::{LogLevel, WorkerContext};

/// Host implementation for the logging interface.
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The worker context to store logs in
    /// * `level` - The log level
    /// * `message` - The log message
    pub fn log(ctx: &mut WorkerContext, level: LogLevel, message: &str) {
        ctx.log(level, message.to_string());

        let worker_id = &ctx.worker_id;
        match level {
            LogLevel::Debug => debug!(worker_id = %worker_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(worker_id = %worker_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(worker_id = %worker_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(worker_id = %worker_id, guest_log = true, "{}", message),
        }
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// 0=debug, 1=info, 2=warn, 3=error; unknown values map to info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}
