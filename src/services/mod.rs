//! Database clients and the plumbing they share.

pub mod backends;
pub mod connector;
pub mod error;
pub mod relational;
pub mod retry;
pub mod sql_files;
pub mod warehouse;
