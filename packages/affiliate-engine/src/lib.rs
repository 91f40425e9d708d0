// Affiliate Program Consistency Engine
//
// Canonical program index built from heterogeneous feeds, a query cache that
// stays coherent with it, and rules that turn index gaps into discovery work.

pub mod audit;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod ingest;
pub mod mapping;
pub mod trigger;
pub mod types;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineHandle};
pub use error::*;
pub use types::*;
