mod api;
mod client;
pub mod models;

pub use api::{PagerDutyApi, MIN_SECONDS_BETWEEN_POLLS, SOURCE_NAME};
pub use client::PagerDutyClient;
