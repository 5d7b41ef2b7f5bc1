//! HTTP route handlers.
//!
//! [`cluster`] exposes the read-only cluster status API. [`local_proxy`] is
//! the gateway's fallback: everything no other route claims is relayed to
//! the local service.

pub mod cluster;
pub mod local_proxy;
