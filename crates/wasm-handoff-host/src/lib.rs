//! Host functions exposed to wasm-handoff worker modules.
//!
//! # Interfaces
//!
//! - `env::log(level, ptr, len)`: structured logging from guest code
//! - `env::sleep_ms(ms)`: asynchronous delay, awaited by the worker
//! - `env::is_worker() -> i32`: 1 inside a worker context
//! - `env::available_parallelism() -> i32`: how many workers the host runs at once
//! - `wasi_snapshot_preview1`: WASI for modules built for `wasm32-wasip1-threads`
//!
//! Guest pointers are resolved against the shared memory the worker was
//! initialized with.

pub mod linker;
pub mod logging;

pub use linker::{create_instance_runner, register_all};
pub use logging::LoggingHost;
