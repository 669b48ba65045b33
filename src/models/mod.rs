//! Row-shaped data exchanged between the clients and the HTTP layer.
//!
//! Everything here is request-scoped; nothing is cached between requests.

pub mod record;
pub mod user;
