//! HTTP integration: the subscription surface and the upstream source.

pub mod routes;
pub mod upstream;
