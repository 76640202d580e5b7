//! Self-refreshing poll cache for on-call and incident monitoring data.
//!
//! [`cache`] holds the generic machinery: keyed entries with a TTL, single-flight
//! background refreshes, a source-wide poll floor and status rollup.
//! [`pagerduty`] wires PagerDuty's REST API into it.

pub mod cache;
pub mod core;
pub mod pagerduty;
