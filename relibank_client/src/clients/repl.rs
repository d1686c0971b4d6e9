//! Interactive REPL-style command-line interface client.

use std::io::{self, Write};
use std::str::SplitWhitespace;

use color_print::{cprint, cprintln};

use rand::Rng;

use tokio::time::{self, Duration};

use relibank::{
    AccountId, Amount, Operation, Outcome, RelibankError, RetryDriver,
};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// How long to pause after an unexpected error before offering the prompt
/// again.
const ERROR_COOLDOWN: Duration = Duration::from_secs(10);

/// Recognizable command types.
enum ReplCommand {
    /// Normal banking operation.
    Op(Operation),

    /// Reconnect to the service.
    Reconnect,

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
pub struct ClientRepl {
    /// Retrying request driver.
    driver: RetryDriver,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client.
    pub fn new(driver: RetryDriver) -> Self {
        ClientRepl {
            driver,
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    #[inline]
    fn print_prompt() {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush().unwrap();
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&RelibankError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported banking commands are:");
        println!("          deposit <account> <amount>");
        println!("          withdraw <account> <amount>");
        println!("          balance <account>");
        println!("          open [account]");
        println!("          info <account>");
        println!("          close <account>");
        println!("      Other commands:");
        println!("          reconnect");
        println!("          help");
        println!("          exit");
        println!("      'open' without an account generates a random ID");
        io::stdout().flush().unwrap();
    }

    /// Expect to get the next segment string from parsed segs.
    #[inline]
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
    ) -> Result<&'s str, RelibankError> {
        if let Some(seg) = segs.next() {
            Ok(seg)
        } else {
            let err = RelibankError::msg("not enough args");
            Self::print_help(Some(&err));
            Err(err)
        }
    }

    /// Parses an account ID segment.
    #[inline]
    fn parse_account(seg: &str) -> Result<AccountId, RelibankError> {
        match seg.parse::<AccountId>() {
            Ok(account) => Ok(account),
            Err(_) => {
                let err = RelibankError::msg(format!(
                    "invalid account ID '{}'",
                    seg
                ));
                Self::print_help(Some(&err));
                Err(err)
            }
        }
    }

    /// Parses an amount segment, rejecting negative amounts before they
    /// ever reach the service.
    #[inline]
    fn parse_amount(seg: &str) -> Result<Amount, RelibankError> {
        let amount = match seg.parse::<Amount>() {
            Ok(amount) => amount,
            Err(e) => {
                Self::print_help(Some(&e));
                return Err(e);
            }
        };
        if amount.is_negative() {
            let err = RelibankError::msg(format!(
                "amount '{}' must be non-negative",
                seg
            ));
            Self::print_help(Some(&err));
            return Err(err);
        }
        Ok(amount)
    }

    /// Generates a random account ID for a new account.
    fn gen_account_id() -> AccountId {
        rand::thread_rng().gen::<u64>() & (i64::MAX as u64)
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, RelibankError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }

        let line: &str = self.input_buf.trim();
        if line.is_empty() {
            return Ok(ReplCommand::Nothing);
        }

        // split input line by whitespaces, getting an iterator of segments
        let mut segs = self.input_buf.split_whitespace();

        // get command type, match case-insensitively
        let cmd_type = segs.next();
        debug_assert!(cmd_type.is_some());

        match &cmd_type.unwrap().to_lowercase()[..] {
            "deposit" => {
                let account = Self::parse_account(Self::expect_next_seg(
                    &mut segs,
                )?)?;
                let amount =
                    Self::parse_amount(Self::expect_next_seg(&mut segs)?)?;
                Ok(ReplCommand::Op(Operation::Deposit { account, amount }))
            }

            "withdraw" => {
                let account = Self::parse_account(Self::expect_next_seg(
                    &mut segs,
                )?)?;
                let amount =
                    Self::parse_amount(Self::expect_next_seg(&mut segs)?)?;
                Ok(ReplCommand::Op(Operation::Withdraw { account, amount }))
            }

            "balance" => {
                let account = Self::parse_account(Self::expect_next_seg(
                    &mut segs,
                )?)?;
                Ok(ReplCommand::Op(Operation::GetBalance { account }))
            }

            "open" => {
                let account = match segs.next() {
                    Some(seg) => Self::parse_account(seg)?,
                    None => {
                        let account = Self::gen_account_id();
                        println!("Generated account ID: {}", account);
                        account
                    }
                };
                Ok(ReplCommand::Op(Operation::CreateAccount { account }))
            }

            "info" => {
                let account = Self::parse_account(Self::expect_next_seg(
                    &mut segs,
                )?)?;
                Ok(ReplCommand::Op(Operation::GetAccountInfo { account }))
            }

            "close" => {
                let account = Self::parse_account(Self::expect_next_seg(
                    &mut segs,
                )?)?;
                Ok(ReplCommand::Op(Operation::DeleteAccount { account }))
            }

            "help" => Ok(ReplCommand::PrintHelp),

            "reconnect" => Ok(ReplCommand::Reconnect),

            "exit" => Ok(ReplCommand::Exit),

            _ => {
                let err = RelibankError::msg(format!(
                    "unrecognized command: {}",
                    cmd_type.unwrap()
                ));
                Self::print_help(Some(&err));
                Err(err)
            }
        }
    }

    /// Prints operation outcome.
    fn print_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed(result) => {
                if result.success {
                    cprintln!("<bright-green>✓</> {}", result.message);
                } else {
                    cprintln!("<bright-red>✗</> {}", result.message);
                }
            }

            Outcome::NoResponse { attempts } => {
                cprintln!(
                    "<bright-red>✗</> No response from server after {} attempts",
                    attempts
                );
            }
        }

        io::stdout().flush().unwrap();
    }

    /// One iteration of the REPL loop.
    async fn iter(&mut self) -> Result<bool, RelibankError> {
        Self::print_prompt();

        let cmd = self.read_command()?;
        match cmd {
            ReplCommand::Exit => {
                println!("Exitting...");
                Ok(false)
            }

            ReplCommand::Nothing => Ok(true),

            ReplCommand::Reconnect => {
                println!("Reconnecting...");
                self.driver.connect().await?;
                Ok(true)
            }

            ReplCommand::PrintHelp => {
                Self::print_help(None);
                Ok(true)
            }

            ReplCommand::Op(op) => {
                match self.driver.invoke(op).await {
                    Ok(outcome) => self.print_outcome(outcome),
                    Err(e) => {
                        // unexpected transport-level failure; cool down,
                        // then try to re-establish the connection
                        cprintln!("<bright-red>✗</> An error occurred: {}", e);
                        time::sleep(ERROR_COOLDOWN).await;
                        if let Err(e) = self.driver.connect().await {
                            cprintln!(
                                "<bright-red>✗</> Reconnection failed: {}",
                                e
                            );
                        }
                    }
                }
                Ok(true)
            }
        }
    }

    /// Runs the infinite REPL loop.
    pub async fn run(&mut self) -> Result<(), RelibankError> {
        self.driver.connect().await?;

        loop {
            if let Ok(false) = self.iter().await {
                break;
            }
        }

        Ok(())
    }
}
