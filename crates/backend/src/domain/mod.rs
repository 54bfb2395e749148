//! Domain types - core business entities
//!
//! Configuration, queue payloads and the path-derived candidate identity.
//! These types are independent of the queue backend and the collaborators.

pub mod config;
pub mod event;
pub mod identity;
