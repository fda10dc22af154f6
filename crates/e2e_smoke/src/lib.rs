//! End-to-end gateway scenarios; see `tests/smoke.rs`.
