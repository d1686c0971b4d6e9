//! Relibank public interface.
//!
//! A teaching model of exactly-once operation semantics: a banking service
//! that loses work and replies on purpose, and a client retry driver that
//! still achieves at-most-one application of every operation it retries.

#[macro_use]
mod utils;

mod registry;

mod server;

mod client;

pub use crate::registry::{
    CallMsg, Registry, ServiceStub, ATM_SERVICE, BRANCH_SERVICE,
};
pub use crate::server::{
    AccountId, Admission, Amount, ApiReply, ApiRequest, BankService,
    FaultInjector, Ledger, OpResult, Operation, RandomFaults, RequestExecutor,
    RequestId, RequestTracker, ScriptedFaults, ServiceConfig,
};
pub use crate::client::{Outcome, RetryConfig, RetryDriver};
pub use crate::utils::{logger_init, RelibankError, Timer, ME};
