//! Domain model of toll billing: ledger records, toll events, workflow runs
//! and the ports the application layer talks to.

pub mod ledger;
pub mod plate_pattern;
pub mod ports;
pub mod toll_event;
pub mod workflow;
