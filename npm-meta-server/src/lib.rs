//! npm-meta server components
//!
//! The management API, the login session table and the background orphan
//! sweep. `main.rs` wires them to a real NPM client and libSQL store.

pub mod api;
pub mod reaper;
pub mod sessions;
