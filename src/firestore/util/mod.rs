mod async_queue;
pub(crate) mod runtime;

pub use async_queue::AsyncQueue;
