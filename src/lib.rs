pub mod api;
pub mod audit;
pub mod compliance;
pub mod config;
pub mod crypto;
pub mod error;
pub mod service;

pub use error::LedgerError;
pub use service::{LedgerService, Operation, OperationResponse};
