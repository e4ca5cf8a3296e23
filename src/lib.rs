pub mod adapters;
pub mod engine;
pub mod prelude;
pub mod serve;
pub mod sweep;

pub use rill_core as core;
pub use rill_pg as pg;
