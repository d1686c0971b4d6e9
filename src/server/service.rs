//! The bank service: dispatcher, request handlers, and the exactly-once
//! admission flow tying the tracker, ledger, faults, and executor together.

use std::sync::Arc;

use crate::registry::{CallMsg, Registry, ATM_SERVICE, BRANCH_SERVICE};
use crate::server::{
    AccountId, Admission, Amount, FaultInjector, Ledger, OpResult, Operation,
    RequestExecutor, RequestId, RequestTracker,
};
use crate::utils::RelibankError;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Request sent to the service.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Client-generated request ID, the idempotency key of this logical
    /// operation across all of its retries.
    pub id: RequestId,

    /// Operation to perform.
    pub op: Operation,
}

/// Reply sent back to the caller. `result: None` means the outcome was lost
/// on the simulated wire; the operation may or may not have been applied,
/// and only a retry with the same request ID can find out.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    /// ID of the request this reply is for.
    pub id: RequestId,

    /// The operation's result, absent if dropped or rejected.
    pub result: Option<OpResult>,
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Probability that one fault-injection draw drops the outcome.
    pub fault_probability: f64,

    /// Upper bound of the sampled per-request processing delay in millisecs.
    pub max_process_delay_ms: u64,

    /// Fixed processing delay of the account-info path in millisecs. Kept
    /// above the client's attempt timeout so timeouts get exercised without
    /// relying on fault draws.
    pub info_fixed_delay_ms: u64,

    /// Max number of request handlers running concurrently.
    pub pool_size: usize,

    /// Capacity of the incoming call channel.
    pub chan_call_cap: usize,

    /// Accounts opened with zero balance at service startup.
    pub seed_accounts: Vec<AccountId>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            fault_probability: 0.3,
            max_process_delay_ms: 4000,
            info_fixed_delay_ms: 5000,
            pool_size: 32,
            chan_call_cap: 256,
            seed_accounts: vec![5000, 8080],
        }
    }
}

/// State shared between the dispatcher task and all running handlers.
struct ServiceInner {
    /// Configuration parameters struct.
    config: ServiceConfig,

    /// Account balances.
    ledger: Ledger,

    /// Request dedup state.
    tracker: RequestTracker,

    /// Source of simulated faults and delays.
    faults: Arc<dyn FaultInjector>,

    /// Bounded pool the handlers run on.
    executor: RequestExecutor,
}

/// The bank service module. Binds itself under both service names and
/// answers every banking operation with exactly-once application semantics.
pub struct BankService {
    /// Shared handler state.
    inner: Arc<ServiceInner>,

    /// Join handle of the dispatcher task.
    dispatcher_handle: Option<JoinHandle<()>>,
}

// BankService public API implementation
impl BankService {
    /// Creates a new bank service with the given fault source.
    pub fn new(
        config: ServiceConfig,
        faults: Arc<dyn FaultInjector>,
    ) -> Result<Self, RelibankError> {
        if !(0.0..=1.0).contains(&config.fault_probability) {
            return logged_err!(
                "invalid fault_probability {}",
                config.fault_probability
            );
        }
        if config.chan_call_cap == 0 {
            return logged_err!(
                "invalid chan_call_cap {}",
                config.chan_call_cap
            );
        }
        let executor = RequestExecutor::new(config.pool_size)?;

        Ok(BankService {
            inner: Arc::new(ServiceInner {
                config,
                ledger: Ledger::new(),
                tracker: RequestTracker::new(),
                faults,
                executor,
            }),
            dispatcher_handle: None,
        })
    }

    /// Opens the seed accounts, binds the service under both registry names,
    /// and spawns the dispatcher task.
    pub async fn setup(
        &mut self,
        registry: &Registry,
    ) -> Result<(), RelibankError> {
        if self.dispatcher_handle.is_some() {
            return logged_err!("setup already done");
        }

        for &account in &self.inner.config.seed_accounts {
            if self.inner.ledger.open(account) {
                pf_info!("mocked account #{}", account);
            }
        }

        let (tx_call, rx_call) =
            mpsc::channel(self.inner.config.chan_call_cap);
        registry.bind(ATM_SERVICE, tx_call.clone())?;
        registry.bind(BRANCH_SERVICE, tx_call)?;

        self.dispatcher_handle = Some(tokio::spawn(Self::dispatcher_task(
            self.inner.clone(),
            rx_call,
        )));
        pf_info!(
            "service bound as '{}' and '{}'",
            ATM_SERVICE,
            BRANCH_SERVICE
        );
        Ok(())
    }

    /// Reads an account's balance directly, bypassing the simulated wire.
    pub fn balance_of(&self, account: AccountId) -> Option<Amount> {
        self.inner.ledger.balance_of(account)
    }

    /// Reads the recorded result of a request ID if it has one.
    pub fn result_of(&self, id: RequestId) -> Option<OpResult> {
        self.inner.tracker.result_of(id)
    }

    /// Number of request IDs with a recorded result.
    pub fn num_recorded(&self) -> usize {
        self.inner.tracker.num_recorded()
    }
}

// BankService dispatcher task implementation
impl BankService {
    /// Dispatcher task function. Every incoming call gets its own delivery
    /// task so slow handlers never block the channel; actual handler
    /// concurrency is capped by the executor pool.
    async fn dispatcher_task(
        inner: Arc<ServiceInner>,
        mut rx_call: mpsc::Receiver<CallMsg>,
    ) {
        pf_debug!("dispatcher task spawned");

        while let Some((req, tx_reply)) = rx_call.recv().await {
            let inner = inner.clone();
            tokio::spawn(async move {
                let id = req.id;
                match inner
                    .executor
                    .submit(Self::handle(inner.clone(), req))
                    .await
                {
                    Ok(result) => {
                        // the caller may have timed out and gone away
                        let _ = tx_reply.send(ApiReply { id, result });
                    }
                    Err(e) => {
                        pf_error!("#{} - failed to run request: {}", id, e);
                    }
                }
            });
        }

        // all call senders dropped, the service is unreachable from here on
        pf_debug!("dispatcher task exitted");
    }

    /// Handles one request with exactly-once admission. Returning `None`
    /// means the outcome was dropped (rejection, processing fault, or
    /// response fault); the ledger may still have been mutated in the
    /// response-fault case, which is precisely what the request log covers.
    async fn handle(
        inner: Arc<ServiceInner>,
        req: ApiRequest,
    ) -> Option<OpResult> {
        let ApiRequest { id, op } = req;
        pf_debug!("#{} - {} request received", id, op.kind());

        match inner.tracker.admit(id) {
            Admission::Busy => {
                pf_warn!(
                    "#{} - request already in processing, no response",
                    id
                );
                None
            }

            Admission::Replay(result) => {
                pf_info!("#{} - {} request is repeated", id, op.kind());
                pf_debug!("#{} - sending response to client again", id);
                if inner.faults.should_drop(inner.config.fault_probability) {
                    pf_warn!("#{} - error while sending response", id);
                    return None;
                }
                Some(result)
            }

            Admission::Fresh => {
                pf_debug!("#{} - processing request", id);
                time::sleep(Self::processing_delay(&inner, &op)).await;

                if inner.faults.should_drop(inner.config.fault_probability) {
                    // failed before any effect; leave no trace so a retry
                    // of this ID gets processed from scratch
                    pf_warn!("#{} - error while processing request", id);
                    inner.tracker.abandon(id);
                    return None;
                }

                let result = inner.ledger.apply(&op);
                inner.tracker.record(id, result.clone());
                if result.success {
                    pf_info!(
                        "#{} - {} request processed successfully",
                        id,
                        op.kind()
                    );
                } else {
                    pf_warn!(
                        "#{} - {} request could not be processed: {}",
                        id,
                        op.kind(),
                        result.message
                    );
                }

                pf_debug!("#{} - sending response to client", id);
                if inner.faults.should_drop(inner.config.fault_probability) {
                    // the result stays recorded, so a retry of this ID will
                    // replay it instead of applying again
                    pf_warn!("#{} - error while sending response", id);
                    return None;
                }
                Some(result)
            }
        }
    }

    /// Simulated processing delay of one request. The account-info path has
    /// a fixed configured delay; everything else gets a sampled one.
    fn processing_delay(inner: &ServiceInner, op: &Operation) -> Duration {
        match op {
            Operation::GetAccountInfo { .. } => {
                Duration::from_millis(inner.config.info_fixed_delay_ms)
            }
            _ => inner.faults.process_delay(Duration::from_millis(
                inner.config.max_process_delay_ms,
            )),
        }
    }
}
