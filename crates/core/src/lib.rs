//! Core domain and synchronization primitives for Daystack.

pub mod domain;
pub mod errors;
pub mod sync;
