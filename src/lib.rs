pub mod config;
pub mod context;
pub mod errors;
pub mod graph;
pub mod orchestrator;
pub mod planner;
pub mod publish;
pub mod sandbox;
pub mod tools;
pub mod trigger;
