//! Request log capture: bounded buffer, batched persistence.

pub mod buffer;
pub mod flusher;
pub mod repository;

pub use buffer::{RequestLogBuffer, RequestLogCreate};
pub use flusher::RequestLogsFlushScheduler;
pub use repository::RequestLogsRepository;
