//! Client-side retry driver: issues operations under a hard per-attempt
//! timeout and retries lost ones, reusing the same request ID so the service
//! can deduplicate.

use std::sync::Arc;

use crate::registry::{Registry, ATM_SERVICE, BRANCH_SERVICE};
use crate::server::{
    AccountId, Amount, ApiReply, ApiRequest, OpResult, Operation, RequestId,
};
use crate::utils::{RelibankError, Timer};

use rand::Rng;

use serde::Deserialize;

use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Max number of attempts per logical operation.
    pub max_attempts: u32,

    /// Per-attempt reply timeout in millisecs.
    pub attempt_timeout_ms: u64,

    /// Fixed wait between attempts in millisecs.
    pub retry_backoff_ms: u64,

    /// Number of connection lookups tried before giving up on the service.
    pub reconnect_tries: u32,

    /// Wait between connection lookups in millisecs.
    pub reconnect_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            attempt_timeout_ms: 3000,
            retry_backoff_ms: 1500,
            reconnect_tries: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

/// Final outcome of one driven logical operation.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Outcome {
    /// The service delivered a result; business success or failure, it is
    /// final.
    Completed(OpResult),

    /// No attempt produced a response before retries ran out. The
    /// operation may or may not have been applied server-side.
    NoResponse {
        /// How many attempts were made.
        attempts: u32,
    },
}

/// What a single attempt produced.
enum Attempt {
    /// A reply carrying a result arrived in time.
    Delivered(OpResult),

    /// A reply arrived but carried no result; dropped or rejected
    /// server-side.
    Empty,

    /// No reply within the attempt timeout.
    TimedOut,

    /// The call itself failed; service gone or never bound.
    Failed(RelibankError),
}

/// Generates the request ID for one logical operation: a uniformly random
/// non-negative 63-bit integer.
fn gen_request_id() -> RequestId {
    rand::thread_rng().gen::<u64>() & (i64::MAX as u64)
}

/// The retry driver. All banking operations go through `invoke()`, which
/// owns the attempt loop.
pub struct RetryDriver {
    /// Registry that service stubs are looked up from. Each attempt gets a
    /// fresh stub, so a rebound service is picked up transparently.
    registry: Arc<Registry>,

    /// Configuration parameters struct.
    config: RetryConfig,

    /// Reply timeout timer.
    timer: Timer,
}

impl RetryDriver {
    /// Creates a new retry driver against the given registry.
    pub fn new(
        registry: Arc<Registry>,
        config: RetryConfig,
    ) -> Result<Self, RelibankError> {
        if config.max_attempts == 0 {
            return logged_err!(
                "invalid max_attempts {}",
                config.max_attempts
            );
        }
        if config.attempt_timeout_ms == 0 {
            return logged_err!(
                "invalid attempt_timeout_ms {}",
                config.attempt_timeout_ms
            );
        }
        if config.reconnect_tries == 0 {
            return logged_err!(
                "invalid reconnect_tries {}",
                config.reconnect_tries
            );
        }

        Ok(RetryDriver {
            registry,
            config,
            timer: Timer::new(),
        })
    }

    /// Waits until both service names are bound, with a bounded number of
    /// lookup tries.
    pub async fn connect(&mut self) -> Result<(), RelibankError> {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        for try_num in 1..=self.config.reconnect_tries {
            if self.registry.lookup(ATM_SERVICE).is_ok()
                && self.registry.lookup(BRANCH_SERVICE).is_ok()
            {
                pf_info!(
                    "connected to '{}' and '{}'",
                    ATM_SERVICE,
                    BRANCH_SERVICE
                );
                return Ok(());
            }
            if try_num < self.config.reconnect_tries {
                pf_warn!(
                    "services not bound, trying to reconnect ({}/{})",
                    try_num,
                    self.config.reconnect_tries
                );
                time::sleep(delay).await;
            }
        }
        logged_err!(
            "services unreachable after {} tries",
            self.config.reconnect_tries
        )
    }

    /// Deposits amount into an account.
    pub async fn deposit(
        &mut self,
        account: AccountId,
        amount: Amount,
    ) -> Result<Outcome, RelibankError> {
        self.invoke(Operation::Deposit { account, amount }).await
    }

    /// Withdraws amount from an account.
    pub async fn withdraw(
        &mut self,
        account: AccountId,
        amount: Amount,
    ) -> Result<Outcome, RelibankError> {
        self.invoke(Operation::Withdraw { account, amount }).await
    }

    /// Queries an account's balance.
    pub async fn get_balance(
        &mut self,
        account: AccountId,
    ) -> Result<Outcome, RelibankError> {
        self.invoke(Operation::GetBalance { account }).await
    }

    /// Opens a new account under the given ID.
    pub async fn create_account(
        &mut self,
        account: AccountId,
    ) -> Result<Outcome, RelibankError> {
        self.invoke(Operation::CreateAccount { account }).await
    }

    /// Closes an account.
    pub async fn delete_account(
        &mut self,
        account: AccountId,
    ) -> Result<Outcome, RelibankError> {
        self.invoke(Operation::DeleteAccount { account }).await
    }

    /// Queries whether an account exists and its balance if so.
    pub async fn get_account_info(
        &mut self,
        account: AccountId,
    ) -> Result<Outcome, RelibankError> {
        self.invoke(Operation::GetAccountInfo { account }).await
    }

    /// Drives one logical operation to an outcome. Generates the request ID
    /// once and reuses it on every attempt; regenerating it would hand a
    /// duplicate effect a fresh idempotency key.
    pub async fn invoke(
        &mut self,
        op: Operation,
    ) -> Result<Outcome, RelibankError> {
        let id = gen_request_id();
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);

        for attempt in 1..=self.config.max_attempts {
            match self.attempt(id, &op).await {
                Attempt::Delivered(result) => {
                    pf_debug!(
                        "#{} - {} completed on attempt {}/{}",
                        id,
                        op.kind(),
                        attempt,
                        self.config.max_attempts
                    );
                    return Ok(Outcome::Completed(result));
                }
                Attempt::Empty => {
                    pf_warn!(
                        "#{} - no response from server (attempt {}/{})",
                        id,
                        attempt,
                        self.config.max_attempts
                    );
                }
                Attempt::TimedOut => {
                    pf_warn!(
                        "#{} - timed-out waiting for reply (attempt {}/{})",
                        id,
                        attempt,
                        self.config.max_attempts
                    );
                }
                Attempt::Failed(e) => {
                    pf_warn!(
                        "#{} - attempt {}/{} failed: {}",
                        id,
                        attempt,
                        self.config.max_attempts,
                        e
                    );
                }
            }
            if attempt < self.config.max_attempts {
                time::sleep(backoff).await;
            }
        }

        pf_warn!(
            "#{} - {} gave up after {} attempts",
            id,
            op.kind(),
            self.config.max_attempts
        );
        Ok(Outcome::NoResponse {
            attempts: self.config.max_attempts,
        })
    }

    /// Makes one attempt: look the service up, send the request, and race
    /// the reply against the attempt timer. On timeout the call future is
    /// dropped; the service may still finish the work, which the request
    /// log absorbs on the next attempt.
    async fn attempt(&mut self, id: RequestId, op: &Operation) -> Attempt {
        let stub = match self.registry.lookup(op.service_name()) {
            Ok(stub) => stub,
            Err(e) => return Attempt::Failed(e),
        };
        if let Err(e) = self
            .timer
            .restart(Duration::from_millis(self.config.attempt_timeout_ms))
        {
            return Attempt::Failed(e);
        }

        tokio::select! {
            () = self.timer.timeout() => {
                Attempt::TimedOut
            }

            reply = stub.call(ApiRequest { id, op: op.clone() }) => {
                match reply {
                    Ok(ApiReply { id: reply_id, result: Some(result) })
                        if reply_id == id =>
                    {
                        Attempt::Delivered(result)
                    }
                    Ok(_) => Attempt::Empty,
                    Err(e) => Attempt::Failed(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod driver_tests {
    use super::*;
    use crate::server::{
        BankService, FaultInjector, ScriptedFaults, ServiceConfig,
    };

    fn quick_service_config() -> ServiceConfig {
        ServiceConfig {
            max_process_delay_ms: 0,
            info_fixed_delay_ms: 0,
            ..ServiceConfig::default()
        }
    }

    fn quick_retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            attempt_timeout_ms: 200,
            retry_backoff_ms: 20,
            reconnect_tries: 2,
            reconnect_delay_ms: 10,
        }
    }

    async fn fixture(
        service_config: ServiceConfig,
        retry_config: RetryConfig,
        faults: Arc<dyn FaultInjector>,
    ) -> Result<(Arc<Registry>, BankService, RetryDriver), RelibankError>
    {
        let registry = Arc::new(Registry::new());
        let mut service = BankService::new(service_config, faults)?;
        service.setup(&registry).await?;
        let mut driver = RetryDriver::new(registry.clone(), retry_config)?;
        driver.connect().await?;
        Ok((registry, service, driver))
    }

    #[test]
    fn gen_request_id_non_negative() {
        for _ in 0..100 {
            assert!(gen_request_id() <= i64::MAX as u64);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_config_rejected() {
        let registry = Arc::new(Registry::new());
        let config = RetryConfig {
            max_attempts: 0,
            ..quick_retry_config()
        };
        assert!(RetryDriver::new(registry.clone(), config).is_err());
        let config = RetryConfig {
            attempt_timeout_ms: 0,
            ..quick_retry_config()
        };
        assert!(RetryDriver::new(registry, config).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_bounded_tries() -> Result<(), RelibankError> {
        let registry = Arc::new(Registry::new());
        let mut driver =
            RetryDriver::new(registry.clone(), quick_retry_config())?;
        assert!(driver.connect().await.is_err());
        let mut service = BankService::new(
            quick_service_config(),
            Arc::new(ScriptedFaults::none()),
        )?;
        service.setup(&registry).await?;
        driver.connect().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drive_success_without_faults() -> Result<(), RelibankError> {
        let (_registry, service, mut driver) = fixture(
            quick_service_config(),
            quick_retry_config(),
            Arc::new(ScriptedFaults::none()),
        )
        .await?;
        let outcome =
            driver.deposit(5000, Amount::from_cents(10000)).await?;
        match outcome {
            Outcome::Completed(result) => {
                assert!(result.success);
                assert_eq!(
                    result.message,
                    "Deposited 100.00 successfully into account #5000"
                );
            }
            Outcome::NoResponse { .. } => panic!("expected a result"),
        }
        assert_eq!(service.balance_of(5000), Some(Amount::from_cents(10000)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_reuses_request_id() -> Result<(), RelibankError> {
        // first attempt applies the deposit but its response is dropped;
        // only a second attempt under the same ID can hit the replay path
        let (_registry, service, mut driver) = fixture(
            quick_service_config(),
            quick_retry_config(),
            Arc::new(ScriptedFaults::new([false, true], false)),
        )
        .await?;
        let outcome =
            driver.deposit(5000, Amount::from_cents(10000)).await?;
        assert!(matches!(
            outcome,
            Outcome::Completed(OpResult { success: true, .. })
        ));
        // a regenerated ID would have deposited twice here
        assert_eq!(service.balance_of(5000), Some(Amount::from_cents(10000)));
        assert_eq!(service.num_recorded(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_attempt_retried_fresh() -> Result<(), RelibankError>
    {
        // first attempt dies in processing (not memoized), second attempt
        // gets admitted fresh and completes
        let (_registry, service, mut driver) = fixture(
            quick_service_config(),
            quick_retry_config(),
            Arc::new(ScriptedFaults::new([true], false)),
        )
        .await?;
        let outcome =
            driver.deposit(5000, Amount::from_cents(10000)).await?;
        assert!(matches!(
            outcome,
            Outcome::Completed(OpResult { success: true, .. })
        ));
        assert_eq!(service.balance_of(5000), Some(Amount::from_cents(10000)));
        assert_eq!(service.num_recorded(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exhaustion_applies_at_most_once() -> Result<(), RelibankError>
    {
        // processing succeeds once, then every response delivery is
        // dropped; the client never learns the outcome but the deposit
        // must land exactly once
        let retry_config = RetryConfig {
            retry_backoff_ms: 10,
            ..quick_retry_config()
        };
        let (_registry, service, mut driver) = fixture(
            quick_service_config(),
            retry_config,
            Arc::new(ScriptedFaults::new([false], true)),
        )
        .await?;
        let outcome =
            driver.deposit(5000, Amount::from_cents(10000)).await?;
        assert_eq!(outcome, Outcome::NoResponse { attempts: 3 });
        assert_eq!(service.balance_of(5000), Some(Amount::from_cents(10000)));
        assert_eq!(service.num_recorded(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exhaustion_with_nothing_applied() -> Result<(), RelibankError>
    {
        // every attempt dies in processing; no effect, no log entry
        let retry_config = RetryConfig {
            retry_backoff_ms: 10,
            ..quick_retry_config()
        };
        let (_registry, service, mut driver) = fixture(
            quick_service_config(),
            retry_config,
            Arc::new(ScriptedFaults::new([], true)),
        )
        .await?;
        let outcome =
            driver.deposit(5000, Amount::from_cents(10000)).await?;
        assert_eq!(outcome, Outcome::NoResponse { attempts: 3 });
        assert_eq!(service.balance_of(5000), Some(Amount::ZERO));
        assert_eq!(service.num_recorded(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timeout_then_replay_completes() -> Result<(), RelibankError> {
        // account-info takes 100ms against a 40ms attempt timeout; the
        // first attempt times out, a later one replays the recorded result
        let service_config = ServiceConfig {
            info_fixed_delay_ms: 100,
            ..quick_service_config()
        };
        let retry_config = RetryConfig {
            max_attempts: 3,
            attempt_timeout_ms: 40,
            retry_backoff_ms: 150,
            ..quick_retry_config()
        };
        let (_registry, service, mut driver) = fixture(
            service_config,
            retry_config,
            Arc::new(ScriptedFaults::none()),
        )
        .await?;
        let outcome = driver.get_account_info(8080).await?;
        match outcome {
            Outcome::Completed(result) => {
                assert!(result.success);
                assert_eq!(
                    result.message,
                    "Account #8080 is open with balance $0.00"
                );
            }
            Outcome::NoResponse { .. } => panic!("expected a result"),
        }
        assert_eq!(service.num_recorded(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drive_all_operations() -> Result<(), RelibankError> {
        let (_registry, service, mut driver) = fixture(
            quick_service_config(),
            quick_retry_config(),
            Arc::new(ScriptedFaults::none()),
        )
        .await?;

        let outcome = driver.create_account(123).await?;
        assert!(matches!(
            outcome,
            Outcome::Completed(OpResult { success: true, .. })
        ));

        driver.deposit(123, Amount::from_cents(5000)).await?;
        driver.withdraw(123, Amount::from_cents(1500)).await?;
        assert_eq!(service.balance_of(123), Some(Amount::from_cents(3500)));

        let outcome = driver.get_balance(123).await?;
        assert_eq!(
            outcome,
            Outcome::Completed(OpResult::ok(
                "Balance for account #123: $35.00"
            ))
        );

        let outcome = driver.delete_account(123).await?;
        assert!(matches!(
            outcome,
            Outcome::Completed(OpResult { success: true, .. })
        ));
        assert_eq!(service.balance_of(123), None);

        let outcome = driver.get_account_info(123).await?;
        assert_eq!(
            outcome,
            Outcome::Completed(OpResult::fail("Account #123 not found"))
        );
        Ok(())
    }
}
