//! Streaming upload/download engine: range planning and bounded-concurrency
//! dispatch for chunked transfers (§2, §4.5, §4.6).

pub mod batch_scheduler;
pub mod range_planner;
