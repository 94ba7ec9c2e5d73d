//! Collaborators the request path consults: token verification and the
//! query executor behind the JSON endpoint.

pub mod auth;
pub mod query;
