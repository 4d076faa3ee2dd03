//! Central-side orchestration of GATT peripherals: scanning with deduplication,
//! one supervised session per peripheral, capability discovery and subscriptions.

pub mod domain;
pub mod infrastructure;
