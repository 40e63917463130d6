//! Purpose: Library crate for the lookaside store used by the `lookaside` CLI and tests.
//! Exports: `api` (stable surface), `config`, and `core` (store, backend, records, errors).
//! Role: Lifecycle and lending for the hidden table that parks evicted record versions.
//! Invariants: No ambient globals; every store is owned by the connection that created it.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod config;
pub mod core;
