//! Small self-contained helpers that don't belong to any one module.
//!
//! Mirrors the teacher's own `utils` split (a grab-bag module re-exporting
//! focused submodules rather than one flat file).
pub mod http;
