//! Parsing of `<busconfig>` XML files into the listen addresses, policy
//! rules, service directories and resource limits a broker is configured
//! from.
//!
//! The parsed structures borrow from the input document; mapping them onto
//! broker configuration is left to the caller.

pub use self::elements::{Config, Context, Limit, Policy, Rule};
mod elements;

pub use self::error::{Error, Result};
mod error;

pub use self::parser::parse_config;
mod parser;
