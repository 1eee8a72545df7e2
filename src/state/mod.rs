//! Client-side state models.
//!
//! SYSTEM CONTEXT
//! ==============
//! State structs are plain data snapshots; the session manager owns the only
//! writer and hands out read-only copies to guards and views.

pub mod auth;
