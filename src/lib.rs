pub mod api;
pub mod core;
pub mod orchestrator;
pub mod unit;
