//! Relibank's client functionality modules.

mod driver;

pub use driver::{Outcome, RetryConfig, RetryDriver};
