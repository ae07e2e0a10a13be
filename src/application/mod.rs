//! Application layer: the billing stages and the durable workflow that
//! strings them together.
//!
//! [`orchestrator::TollWorkflow`] owns the state machine. Each stage module
//! is a thin service over the domain ports so it can be exercised on its
//! own; [`poller::ActivityPoller`] hands suspended runs to the
//! [`notification`] handlers.

pub mod charging;
pub mod decision;
pub mod extraction;
pub mod notification;
pub mod orchestrator;
pub mod plate_pattern;
pub mod poller;
pub mod retry;
