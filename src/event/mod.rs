//! Handler traits and event payload structs used to observe connection-pool and topology
//! lifecycle without coupling callers to a specific logging backend.

pub mod cmap;
pub mod sdam;

#[cfg(feature = "tracing-unstable")]
mod tracing_handler;

#[cfg(feature = "tracing-unstable")]
pub(crate) use tracing_handler::TracingEventHandler;
