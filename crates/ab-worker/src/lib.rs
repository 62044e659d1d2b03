pub mod compute;
pub mod config;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod session;
pub mod thumbnail;
pub mod transport;
pub mod upload;
pub mod worker;

pub use error::{ComputeError, TransportError, WorkerError};
pub use worker::{Cycle, LoopSettings, WorkerLoop};
