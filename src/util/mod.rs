//! Utility helpers shared by route handling.
//!
//! SYSTEM CONTEXT
//! ==============
//! Guard logic stays free of navigation side effects so it can be evaluated
//! anywhere a state snapshot is available.

pub mod auth;
