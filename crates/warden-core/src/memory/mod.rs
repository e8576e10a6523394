//! Tiered memory: in-process LRU, durable FTS fact store, vector store.
//!
//! Everything written through this module is scrubbed of telemetry and
//! credential material first (see [`filter::clean_telemetry`]); the engine in
//! [`engine`] is the only entry point the rest of the broker uses.

pub mod cache;
pub mod engine;
pub mod facts;
pub mod filter;
pub mod semantic;

pub use engine::{MemoryEngine, MemoryStatus, Retrieval};
pub use filter::clean_telemetry;
