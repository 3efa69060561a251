pub mod config;
pub mod logging;

pub mod chunk;
pub mod error;
pub mod message;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod transport;
pub mod updates;

mod worker;

pub use error::TransferError;
pub use scheduler::TransferScheduler;
