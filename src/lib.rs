//! Purpose: Shared library crate used by the `dsmigrate` CLI and tests.
//! Exports: `core` (record kinds, codecs, archives, counters, errors), `api`, `notice`.
//! Role: Library backing the binary; `api` is the intended entry point.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
//! Invariants: Nothing here writes to stdout; progress and notices go through observers.
pub mod api;
pub mod core;
pub mod notice;
