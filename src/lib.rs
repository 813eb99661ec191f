//! Merge Gate: decides which open pull requests are eligible to merge, across
//! many repositories at once.

pub mod analysis;
pub mod config;
pub mod eligibility;
pub mod github;
pub mod pipeline;
pub mod pr;
pub mod quality;
pub mod report;
pub mod retry;
pub mod scheduler;
