//! Grid Core
//!
//! Core types and abstractions shared by the Grid Server arbiter crates.
//!
//! This crate contains:
//! - Domain types: jobs, resource quantities, Lua values and script executions
//! - DTOs: the JSON command envelope embedded in script executions
//! - Collaborator interfaces: counters, settings and the random source

pub mod domain;
pub mod dto;
pub mod metrics;
pub mod random;
pub mod settings;
