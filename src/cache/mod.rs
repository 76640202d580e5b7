//! Self-refreshing poll cache.
//!
//! A [`PollCache`] owns a set of keyed [`CacheEntry`] slots. Each entry wraps a
//! caller-supplied [`Fetch`] function and keeps the last good value around while
//! refreshes run in the background. Readers never wait on the network.

mod entry;
mod error;
mod fetch;
mod floor;
mod observer;
mod registry;
mod status;

pub use entry::{CacheEntry, EntryConfig, EntrySummary, PollEntry, Refresh, Snapshot};
pub use error::{CacheError, FetchError};
pub use fetch::Fetch;
pub use observer::{FailureObserver, TracingObserver};
pub use registry::{PollCache, PollReport};
pub use status::{overall_status, MonitorStatus, StatusRollup};
