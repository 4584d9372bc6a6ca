//! Tokio runtime for the call
//!
//! The whole call runs on one thread: the session is a single control loop,
//! and PipeWire keeps its own threads for the realtime audio callbacks.

use tokio::runtime::Runtime;

/// Build the single-threaded runtime the call runs on
pub fn build() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name("voxline-call")
        .build()
}
