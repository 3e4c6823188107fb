//! Our subcommands.

pub mod consolidate;
pub mod extract;
pub mod schema;
