//! Core infrastructure: claude CLI launching, framework loading, and the
//! event-stream connection pool.

pub mod framework_loader;
pub mod launcher;
pub mod socketio_pool;
