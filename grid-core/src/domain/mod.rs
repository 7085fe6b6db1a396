//! Core domain types
//!
//! These types are shared between the RPC client (which puts them on the wire)
//! and the arbiter (which binds jobs to running Grid Server instances).

pub mod job;
pub mod lua;
pub mod resource;
