//! Purpose: Shared core library crate used by the `atomstock` binaries and tests.
//! Exports: `core` (counters, persistent store, recipes, protocol, errors).
//! Role: Internal library backing the binaries; not yet a stable public SDK.
//! Invariants: Treat the crate API as internal until a dedicated library release.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod core;
