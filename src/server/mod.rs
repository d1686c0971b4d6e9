//! Relibank's server functionality modules.

mod ledger;
mod dedup;
mod faults;
mod executor;
mod service;

pub use ledger::{AccountId, Amount, Ledger, OpResult, Operation};
pub use dedup::{Admission, RequestId, RequestTracker};
pub use faults::{FaultInjector, RandomFaults, ScriptedFaults};
pub use executor::RequestExecutor;
pub use service::{ApiReply, ApiRequest, BankService, ServiceConfig};
