//! Concurrent LRU cache with an event-queue maintained recency list

mod engine;
mod worker;

pub use engine::{ItemRemovedCallback, LruCache};
pub use worker::WorkerState;
