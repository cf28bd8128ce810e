//! Core types for the omnibus wire protocol.
//!
//! This is split out from the main crate so that tooling which only needs to
//! reason about signatures and protocol constants, such as the configuration
//! parser, doesn't have to pull in the full codec and broker.

#![allow(clippy::module_inception)]

#[macro_use]
mod macros;

pub mod signature;

pub mod proto;
