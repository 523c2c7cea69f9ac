//! Endpoint selection for multi-endpoint transfers
//!
//! - [`Endpoint`]: one S3 endpoint with a passive health score and an
//!   in-flight request counter
//! - [`EndpointSet`]: round-robin assignment of parts and health-aware
//!   selection of retry endpoints
//!
//! Health scores range from 0-100; an endpoint is healthy while its score is
//! above 30. Successes add 10, failures subtract 20, transport failures
//! subtract 70.
//!
//! All types are safe to share across tasks; counters are atomics.

pub mod balancer;
pub mod endpoint;

pub use balancer::EndpointSet;
pub use endpoint::{Endpoint, InFlight};
