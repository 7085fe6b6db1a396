//! Data Transfer Objects
//!
//! Payloads that are serialized into other records before reaching a
//! Grid Server.

pub mod command;
