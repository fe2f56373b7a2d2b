pub mod barcode;
pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod hamming;
pub mod index;
pub mod ivf;
pub mod kmodes;
pub mod matcher;
mod metrics;
pub mod motion;
pub mod orb;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EngineConfig, Opts, SearchMode};
pub use error::{Result, VsError};
pub use session::{Session, SessionBuilder};
