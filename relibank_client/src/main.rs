//! Relibank client side executable.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use tokio::runtime::Builder;

use relibank::{
    logger_init, parsed_config, pf_error, pf_warn, BankService, RandomFaults,
    Registry, RelibankError, RetryConfig, RetryDriver, ServiceConfig, ME,
};

mod clients;

use crate::clients::{ClientMode, ClientRepl, ClientTester};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client utility mode to run: repl|tester.
    #[arg(short, long)]
    utility: String,

    /// Service configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Mode-specific client parameters TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    params: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(mode)` on success or
    /// `Err(RelibankError)` on any error.
    fn sanitize(&self) -> Result<ClientMode, RelibankError> {
        if self.threads < 2 {
            Err(RelibankError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            ClientMode::parse_name(&self.utility).ok_or(RelibankError::msg(
                format!("utility mode '{}' unrecognized", self.utility),
            ))
        }
    }
}

/// Actual main function of Relibank client executable.
fn client_main() -> Result<(), RelibankError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let mode = args.sanitize()?;
    let _ = ME.set(args.utility.to_lowercase());

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };

    // parse optional params string if given
    let params_str = if args.params.is_empty() {
        None
    } else {
        args.params = args.params.replace('+', "\n");
        Some(&args.params[..])
    };

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, bring the simulated service up, and do work
    runtime.block_on(async move {
        match mode {
            ClientMode::Repl => {
                // the registry, the faulty service, and the retrying client
                // all live in this process
                let service_config = parsed_config!(config_str => ServiceConfig;
                                                    fault_probability,
                                                    max_process_delay_ms,
                                                    info_fixed_delay_ms,
                                                    pool_size, chan_call_cap,
                                                    seed_accounts)?;
                let retry_config = parsed_config!(params_str => RetryConfig;
                                                  max_attempts,
                                                  attempt_timeout_ms,
                                                  retry_backoff_ms,
                                                  reconnect_tries,
                                                  reconnect_delay_ms)?;

                let registry = Arc::new(Registry::new());
                let mut service = BankService::new(
                    service_config,
                    Arc::new(RandomFaults),
                )?;
                service.setup(&registry).await?;

                let driver = RetryDriver::new(registry, retry_config)?;

                // run interactive REPL loop
                let mut repl = ClientRepl::new(driver);
                repl.run().await?;
            }
            ClientMode::Tester => {
                // run correctness testing client; scenarios build their own
                // deterministic service instances
                let mut tester = ClientTester::new(params_str)?;
                tester.run().await?;
            }
        }

        Ok::<(), RelibankError>(()) // give type hint for this async closure
    })
}

/// Main function of Relibank client executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exitted: {}", e);
        ExitCode::FAILURE
    } else {
        pf_warn!("client_main exitted successfully");
        ExitCode::SUCCESS
    }
}
