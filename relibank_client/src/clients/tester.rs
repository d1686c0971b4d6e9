//! Correctness testing client driving exactly-once scenarios against
//! deterministic service instances.

use std::sync::Arc;

use futures::future::join_all;

use lazy_static::lazy_static;

use log::{self, LevelFilter};

use serde::Deserialize;

use tokio::time::{self, Duration};

use relibank::{
    logged_err, parsed_config, pf_error, AccountId, Amount, ApiReply,
    ApiRequest, BankService, FaultInjector, OpResult, Operation, Outcome,
    Registry, RelibankError, RequestId, RetryConfig, RetryDriver,
    ScriptedFaults, ServiceConfig,
};

lazy_static! {
    /// List of all tests. If the flag is true, the test is marked as basic.
    static ref ALL_TESTS: Vec<(&'static str, bool)> = vec![
        ("deposit_exact_once", true),
        ("processing_fault_retry", true),
        ("replay_preserves_result", true),
        ("business_failure_final", true),
        ("timeout_replay", true),
        ("retry_exhaustion", true),
        ("in_flight_reject", false),
        ("duplicate_storm", false),
    ];
}

/// Mode parameters struct.
#[derive(Debug, Deserialize)]
pub struct ModeParamsTester {
    /// Name of individual test to run, or 'basic' to run the basic set of
    /// tests, or 'all' to run all tests.
    pub test_name: String,

    /// Whether to continue next test upon failed test.
    pub keep_going: bool,

    /// Do not suppress logger output.
    pub logger_on: bool,
}

impl Default for ModeParamsTester {
    fn default() -> Self {
        ModeParamsTester {
            test_name: "basic".into(),
            keep_going: false,
            logger_on: false,
        }
    }
}

/// Correctness testing client struct.
pub struct ClientTester {
    /// Mode parameters struct.
    params: ModeParamsTester,
}

// ClientTester scenario helpers
impl ClientTester {
    /// Creates a new testing client.
    pub fn new(params_str: Option<&str>) -> Result<Self, RelibankError> {
        let params = parsed_config!(params_str => ModeParamsTester;
                                     test_name, keep_going, logger_on)?;

        // suppress all logger levels if not logger_on
        if !params.logger_on {
            log::set_max_level(LevelFilter::Error);
        }

        Ok(ClientTester { params })
    }

    /// Service configuration with simulated delays turned off.
    fn quick_service_config() -> ServiceConfig {
        ServiceConfig {
            max_process_delay_ms: 0,
            info_fixed_delay_ms: 0,
            ..ServiceConfig::default()
        }
    }

    /// Retry configuration with tight waits for fast scenarios.
    fn quick_retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            attempt_timeout_ms: 500,
            retry_backoff_ms: 20,
            reconnect_tries: 2,
            reconnect_delay_ms: 10,
        }
    }

    /// Brings up a fresh registry, service, and connected driver for one
    /// scenario.
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

    /// Sends one raw request, bypassing the retry driver, so scenarios can
    /// pin the request ID.
    async fn call_raw(
        registry: &Registry,
        id: RequestId,
        op: Operation,
    ) -> Result<ApiReply, RelibankError> {
        let stub = registry.lookup(op.service_name())?;
        stub.call(ApiRequest { id, op }).await
    }

    /// Unwraps an outcome that must carry a result.
    fn expect_completed(outcome: Outcome) -> Result<OpResult, RelibankError> {
        match outcome {
            Outcome::Completed(result) => Ok(result),
            Outcome::NoResponse { attempts } => Err(RelibankError::msg(
                format!("no response after {} attempts", attempts),
            )),
        }
    }

    /// Checks that a result is a business success.
    fn expect_success(result: &OpResult) -> Result<(), RelibankError> {
        if result.success {
            Ok(())
        } else {
            Err(RelibankError::msg(format!(
                "operation failed: {}",
                result.message
            )))
        }
    }

    /// Checks a result's message text.
    fn expect_message(
        result: &OpResult,
        expect: &str,
    ) -> Result<(), RelibankError> {
        if result.message == expect {
            Ok(())
        } else {
            Err(RelibankError::msg(format!(
                "message mismatch: expect '{}', got '{}'",
                expect, result.message
            )))
        }
    }

    /// Checks an account's balance as seen inside the service.
    fn expect_balance(
        service: &BankService,
        account: AccountId,
        expect: Amount,
    ) -> Result<(), RelibankError> {
        match service.balance_of(account) {
            Some(balance) if balance == expect => Ok(()),
            Some(balance) => Err(RelibankError::msg(format!(
                "balance mismatch on #{}: expect {}, got {}",
                account, expect, balance
            ))),
            None => Err(RelibankError::msg(format!(
                "account #{} does not exist",
                account
            ))),
        }
    }

    /// Checks the number of memoized request results.
    fn expect_recorded(
        service: &BankService,
        expect: usize,
    ) -> Result<(), RelibankError> {
        let recorded = service.num_recorded();
        if recorded == expect {
            Ok(())
        } else {
            Err(RelibankError::msg(format!(
                "request log size mismatch: expect {}, got {}",
                expect, recorded
            )))
        }
    }
}

// ClientTester test runner
impl ClientTester {
    /// Runs the individual correctness test.
    async fn do_test_by_name(
        &mut self,
        name: &str,
    ) -> Result<(), RelibankError> {
        let result = match name {
            "deposit_exact_once" => self.test_deposit_exact_once().await,
            "processing_fault_retry" => {
                self.test_processing_fault_retry().await
            }
            "replay_preserves_result" => {
                self.test_replay_preserves_result().await
            }
            "business_failure_final" => {
                self.test_business_failure_final().await
            }
            "timeout_replay" => self.test_timeout_replay().await,
            "retry_exhaustion" => self.test_retry_exhaustion().await,
            "in_flight_reject" => self.test_in_flight_reject().await,
            "duplicate_storm" => self.test_duplicate_storm().await,
            _ => return logged_err!("unrecognized test name '{}'", name),
        };

        if let Err(ref e) = result {
            println!("{:>24} | {:^6} | {}", name, "FAIL", e);
        } else {
            println!("{:>24} | {:^6} | --", name, "PASS");
        }
        result
    }

    /// Runs the specified correctness test.
    pub async fn run(&mut self) -> Result<(), RelibankError> {
        let test_name = self.params.test_name.clone();
        let mut all_pass = true;

        println!("{:^24} | {:^6} | Notes", "Test Case", "Result");
        match &test_name[..] {
            "basic" => {
                for (name, basic) in ALL_TESTS.iter() {
                    if *basic {
                        let result = self.do_test_by_name(name).await;
                        if result.is_err() {
                            all_pass = false;
                            if !self.params.keep_going {
                                return result;
                            }
                        }
                    }
                }
            }
            "all" => {
                for (name, _) in ALL_TESTS.iter() {
                    let result = self.do_test_by_name(name).await;
                    if result.is_err() {
                        all_pass = false;
                        if !self.params.keep_going {
                            return result;
                        }
                    }
                }
            }
            _ => return self.do_test_by_name(&test_name).await,
        }

        if all_pass {
            Ok(())
        } else {
            Err(RelibankError::msg("some test(s) failed"))
        }
    }
}

// List of tests:
impl ClientTester {
    /// Deposit whose first response is dropped lands exactly once after a
    /// retried attempt hits the replay path.
    async fn test_deposit_exact_once(&mut self) -> Result<(), RelibankError> {
        let (_registry, service, mut driver) = Self::fixture(
            Self::quick_service_config(),
            Self::quick_retry_config(),
            Arc::new(ScriptedFaults::new([false, true], false)),
        )
        .await?;
        let outcome = driver.deposit(5000, Amount::from_float(100.0)).await?;
        let result = Self::expect_completed(outcome)?;
        Self::expect_success(&result)?;
        Self::expect_balance(&service, 5000, Amount::from_float(100.0))?;
        Self::expect_recorded(&service, 1)
    }

    /// A processing fault leaves no trace; the retry is admitted fresh and
    /// applies the operation once.
    async fn test_processing_fault_retry(
        &mut self,
    ) -> Result<(), RelibankError> {
        let (_registry, service, mut driver) = Self::fixture(
            Self::quick_service_config(),
            Self::quick_retry_config(),
            Arc::new(ScriptedFaults::new([true], false)),
        )
        .await?;
        let outcome = driver.deposit(5000, Amount::from_float(100.0)).await?;
        let result = Self::expect_completed(outcome)?;
        Self::expect_success(&result)?;
        Self::expect_balance(&service, 5000, Amount::from_float(100.0))?;
        Self::expect_recorded(&service, 1)
    }

    /// Two arrivals under one request ID produce identical results and one
    /// application.
    async fn test_replay_preserves_result(
        &mut self,
    ) -> Result<(), RelibankError> {
        let (registry, service, _driver) = Self::fixture(
            Self::quick_service_config(),
            Self::quick_retry_config(),
            Arc::new(ScriptedFaults::none()),
        )
        .await?;
        let op = Operation::Deposit {
            account: 8080,
            amount: Amount::from_float(42.5),
        };
        let first = Self::call_raw(&registry, 1001, op.clone()).await?;
        let second = Self::call_raw(&registry, 1001, op).await?;
        if first.result != second.result {
            return Err(RelibankError::msg(format!(
                "replay mismatch: {:?} vs {:?}",
                first.result, second.result
            )));
        }
        match first.result {
            Some(ref result) => Self::expect_success(result)?,
            None => {
                return Err(RelibankError::msg("first call carried no result"))
            }
        }
        Self::expect_balance(&service, 8080, Amount::from_float(42.5))?;
        Self::expect_recorded(&service, 1)
    }

    /// Business-rule failures are final results: memoized, not retried.
    async fn test_business_failure_final(
        &mut self,
    ) -> Result<(), RelibankError> {
        let (_registry, service, mut driver) = Self::fixture(
            Self::quick_service_config(),
            Self::quick_retry_config(),
            Arc::new(ScriptedFaults::none()),
        )
        .await?;
        let outcome = driver.withdraw(5000, Amount::from_float(50.0)).await?;
        let result = Self::expect_completed(outcome)?;
        if result.success {
            return Err(RelibankError::msg(
                "withdraw from empty account succeeded",
            ));
        }
        Self::expect_message(&result, "Insufficient funds in account #5000")?;
        Self::expect_balance(&service, 5000, Amount::ZERO)?;
        Self::expect_recorded(&service, 1)
    }

    /// An attempt that outlives the client timeout still completes
    /// server-side; the following attempt replays its recorded result.
    async fn test_timeout_replay(&mut self) -> Result<(), RelibankError> {
        let service_config = ServiceConfig {
            info_fixed_delay_ms: 100,
            ..Self::quick_service_config()
        };
        let retry_config = RetryConfig {
            max_attempts: 3,
            attempt_timeout_ms: 40,
            retry_backoff_ms: 150,
            ..Self::quick_retry_config()
        };
        let (_registry, service, mut driver) = Self::fixture(
            service_config,
            retry_config,
            Arc::new(ScriptedFaults::none()),
        )
        .await?;
        let outcome = driver.get_account_info(5000).await?;
        let result = Self::expect_completed(outcome)?;
        Self::expect_message(
            &result,
            "Account #5000 is open with balance $0.00",
        )?;
        Self::expect_recorded(&service, 1)
    }

    /// When every response delivery is lost the driver gives up, yet the
    /// operation landed at most once.
    async fn test_retry_exhaustion(&mut self) -> Result<(), RelibankError> {
        let retry_config = RetryConfig {
            retry_backoff_ms: 10,
            ..Self::quick_retry_config()
        };
        let (_registry, service, mut driver) = Self::fixture(
            Self::quick_service_config(),
            retry_config,
            Arc::new(ScriptedFaults::new([false], true)),
        )
        .await?;
        let outcome = driver.deposit(5000, Amount::from_float(100.0)).await?;
        match outcome {
            Outcome::NoResponse { attempts: 3 } => {}
            other => {
                return Err(RelibankError::msg(format!(
                    "expected exhaustion, got {:?}",
                    other
                )))
            }
        }
        Self::expect_balance(&service, 5000, Amount::from_float(100.0))?;
        Self::expect_recorded(&service, 1)
    }

    /// A duplicate arriving while the original is still being processed is
    /// rejected without a response.
    async fn test_in_flight_reject(&mut self) -> Result<(), RelibankError> {
        let service_config = ServiceConfig {
            info_fixed_delay_ms: 150,
            ..Self::quick_service_config()
        };
        let (registry, service, _driver) = Self::fixture(
            service_config,
            Self::quick_retry_config(),
            Arc::new(ScriptedFaults::none()),
        )
        .await?;
        let op = Operation::GetAccountInfo { account: 5000 };
        let slow_registry = registry.clone();
        let slow_op = op.clone();
        let slow = tokio::spawn(async move {
            Self::call_raw(&slow_registry, 2002, slow_op).await
        });
        time::sleep(Duration::from_millis(50)).await;
        let dup = Self::call_raw(&registry, 2002, op).await?;
        if dup.result.is_some() {
            return Err(RelibankError::msg(
                "in-flight duplicate got a response",
            ));
        }
        let slow = slow.await??;
        match slow.result {
            Some(ref result) => Self::expect_success(result)?,
            None => {
                return Err(RelibankError::msg(
                    "original attempt carried no result",
                ))
            }
        }
        Self::expect_recorded(&service, 1)
    }

    /// A storm of concurrent duplicates still applies the deposit once.
    async fn test_duplicate_storm(&mut self) -> Result<(), RelibankError> {
        let (registry, service, _driver) = Self::fixture(
            Self::quick_service_config(),
            Self::quick_retry_config(),
            Arc::new(ScriptedFaults::none()),
        )
        .await?;
        let mut calls = vec![];
        for _ in 0..8 {
            let registry = registry.clone();
            calls.push(async move {
                Self::call_raw(
                    &registry,
                    3003,
                    Operation::Deposit {
                        account: 8080,
                        amount: Amount::from_float(100.0),
                    },
                )
                .await
            });
        }
        for reply in join_all(calls).await {
            if let Some(ref result) = reply?.result {
                Self::expect_success(result)?;
            }
        }
        Self::expect_balance(&service, 8080, Amount::from_float(100.0))?;
        Self::expect_recorded(&service, 1)
    }
}

#[cfg(test)]
mod tester_params_tests {
    use super::*;

    #[test]
    fn parse_params_default() -> Result<(), RelibankError> {
        let params = parsed_config!(None => ModeParamsTester;
                                     test_name, keep_going, logger_on)?;
        assert_eq!(params.test_name, "basic");
        assert!(!params.keep_going);
        Ok(())
    }

    #[test]
    fn parse_params_given() -> Result<(), RelibankError> {
        let params_str = Some("test_name = 'duplicate_storm'\nkeep_going = true");
        let params = parsed_config!(params_str => ModeParamsTester;
                                     test_name, keep_going, logger_on)?;
        assert_eq!(params.test_name, "duplicate_storm");
        assert!(params.keep_going);
        Ok(())
    }
}
