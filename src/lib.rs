pub mod artifacts;
pub mod backends;
pub mod config;
pub mod control;
pub mod errors;
pub mod patch;
pub mod pipeline;
pub mod signals;
pub mod store;
pub mod telemetry;
pub mod util;
pub mod worker;
pub mod workspace;
