//! Auth services: the backend seam, the in-memory backend, session
//! persistence, and the session manager that ties them together.

pub mod auth;
pub mod memory;
pub mod session;
pub mod store;
