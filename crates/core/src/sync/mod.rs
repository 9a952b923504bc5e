//! Operation-log synchronization: op model, vector clocks, LWW merge,
//! cycle orchestration, payload envelope.

pub mod adapter;
pub mod apply;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod envelope;
pub mod factory;
pub mod memory;
pub mod op;
pub mod scheduler;
pub mod store;
pub mod vector_clock;

pub use adapter::*;
pub use apply::{decide_lww, ApplyVerdict, MergeReport, MergeResolver, SkippedOp};
pub use config::*;
pub use debounce::ImmediateUploadDebouncer;
pub use engine::*;
pub use envelope::{
    derive_key, EnvelopeConfig, PayloadProtector, ENVELOPE_VERSION, PBKDF2_ITERATIONS,
};
pub use factory::OpFactory;
pub use memory::InMemoryOpLog;
pub use op::*;
pub use scheduler::{SyncScheduler, INTERVAL_JITTER_MS};
pub use store::*;
pub use vector_clock::{ClockOrdering, VectorClock};

#[cfg(test)]
mod tests;
