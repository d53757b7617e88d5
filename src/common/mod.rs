pub mod error;

pub use error::{BoxError, CloseErrors, CloseFailure, RollbackFault};
