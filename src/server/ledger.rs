//! Relibank account ledger, the business state the service operates on.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use crate::registry::{ATM_SERVICE, BRANCH_SERVICE};
use crate::utils::RelibankError;

use serde::{Deserialize, Serialize};

/// Account ID type.
pub type AccountId = u64;

/// Fixed-point currency amount with 2 decimal places, stored as a scaled
/// integer so that balances compare exactly.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
)]
pub struct Amount(i64);

impl Amount {
    const SCALE: i64 = 100;

    /// The zero amount.
    pub const ZERO: Amount = Amount(0);

    /// Creates an amount from a raw number of cents.
    pub fn from_cents(cents: i64) -> Self {
        Amount(cents)
    }

    /// Creates an amount from a float, rounding to the nearest cent.
    pub fn from_float(value: f64) -> Self {
        Amount((value * Self::SCALE as f64).round() as i64)
    }

    /// True if the amount is strictly below zero.
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        let whole = abs / Self::SCALE;
        let frac = abs % Self::SCALE;
        write!(f, "{}{}.{:02}", sign, whole, frac)
    }
}

impl FromStr for Amount {
    type Err = RelibankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sign, body) = match s.strip_prefix('-') {
            Some(rest) => (-1, rest),
            None => (1, s),
        };
        let (whole_str, frac_str) = match body.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (body, ""),
        };
        if whole_str.is_empty() && frac_str.is_empty() {
            return Err(RelibankError::msg(format!("invalid amount '{}'", s)));
        }
        if frac_str.len() > 2 {
            return Err(RelibankError::msg(format!(
                "amount '{}' has more than 2 decimal places",
                s
            )));
        }
        let whole: i64 = if whole_str.is_empty() {
            0
        } else {
            whole_str.parse()?
        };
        let mut frac: i64 = if frac_str.is_empty() {
            0
        } else {
            frac_str.parse()?
        };
        if frac_str.len() == 1 {
            frac *= 10;
        }
        Ok(Amount(sign * (whole * Self::SCALE + frac)))
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// Operation requested on the ledger.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// Add amount to an account's balance.
    Deposit { account: AccountId, amount: Amount },

    /// Subtract amount from an account's balance if covered.
    Withdraw { account: AccountId, amount: Amount },

    /// Read an account's current balance.
    GetBalance { account: AccountId },

    /// Open a new account with zero balance.
    CreateAccount { account: AccountId },

    /// Close an existing account.
    DeleteAccount { account: AccountId },

    /// Report whether an account exists and its balance if so.
    GetAccountInfo { account: AccountId },
}

impl Operation {
    /// Short operation name used in per-request log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Deposit { .. } => "deposit",
            Operation::Withdraw { .. } => "withdraw",
            Operation::GetBalance { .. } => "get_balance",
            Operation::CreateAccount { .. } => "create_account",
            Operation::DeleteAccount { .. } => "delete_account",
            Operation::GetAccountInfo { .. } => "get_account_info",
        }
    }

    /// Registry name of the service this operation is addressed to.
    pub fn service_name(&self) -> &'static str {
        match self {
            Operation::Deposit { .. }
            | Operation::Withdraw { .. }
            | Operation::GetBalance { .. } => ATM_SERVICE,
            Operation::CreateAccount { .. }
            | Operation::DeleteAccount { .. }
            | Operation::GetAccountInfo { .. } => BRANCH_SERVICE,
        }
    }
}

/// Business-level result of an operation. `success` is false for things like
/// unknown accounts or insufficient funds; either way the operation finished
/// and its result is final.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct OpResult {
    /// Whether the operation took effect.
    pub success: bool,

    /// Human-readable description of the outcome.
    pub message: String,
}

impl OpResult {
    /// Creates a successful result.
    pub fn ok(message: impl Into<String>) -> Self {
        OpResult {
            success: true,
            message: message.into(),
        }
    }

    /// Creates a failed (but final) result.
    pub fn fail(message: impl Into<String>) -> Self {
        OpResult {
            success: false,
            message: message.into(),
        }
    }
}

/// The volatile in-memory ledger of account balances.
#[derive(Debug, Default)]
pub struct Ledger {
    /// Map from account ID -> current balance.
    accounts: Mutex<HashMap<AccountId, Amount>>,
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Ledger {
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Opens an account with zero balance if it does not exist yet. Returns
    /// true if a new account was opened.
    pub fn open(&self, account: AccountId) -> bool {
        let mut accounts = self.accounts.lock().expect("poisoned ledger");
        match accounts.entry(account) {
            Entry::Vacant(entry) => {
                entry.insert(Amount::ZERO);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Reads an account's balance, `None` if the account does not exist.
    pub fn balance_of(&self, account: AccountId) -> Option<Amount> {
        let accounts = self.accounts.lock().expect("poisoned ledger");
        accounts.get(&account).copied()
    }

    /// Number of currently open accounts.
    pub fn num_accounts(&self) -> usize {
        let accounts = self.accounts.lock().expect("poisoned ledger");
        accounts.len()
    }

    /// Applies one operation to the ledger and returns its business result.
    /// Always terminates with a final result; retryable conditions are the
    /// caller's concern.
    pub fn apply(&self, op: &Operation) -> OpResult {
        let mut accounts = self.accounts.lock().expect("poisoned ledger");
        match *op {
            Operation::Deposit { account, amount } => {
                match accounts.get_mut(&account) {
                    Some(balance) => {
                        *balance += amount;
                        OpResult::ok(format!(
                            "Deposited {} successfully into account #{}",
                            amount, account
                        ))
                    }
                    None => OpResult::fail(format!(
                        "Account #{} not found",
                        account
                    )),
                }
            }
            Operation::Withdraw { account, amount } => {
                match accounts.get_mut(&account) {
                    Some(balance) if *balance >= amount => {
                        *balance -= amount;
                        OpResult::ok(format!(
                            "Withdrew {} successfully from account #{}",
                            amount, account
                        ))
                    }
                    Some(_) => OpResult::fail(format!(
                        "Insufficient funds in account #{}",
                        account
                    )),
                    None => OpResult::fail(format!(
                        "Account #{} not found",
                        account
                    )),
                }
            }
            Operation::GetBalance { account } => match accounts.get(&account)
            {
                Some(balance) => OpResult::ok(format!(
                    "Balance for account #{}: ${}",
                    account, balance
                )),
                None => {
                    OpResult::fail(format!("Account #{} not found", account))
                }
            },
            Operation::CreateAccount { account } => {
                match accounts.entry(account) {
                    Entry::Vacant(entry) => {
                        entry.insert(Amount::ZERO);
                        OpResult::ok(format!(
                            "Account #{} created successfully",
                            account
                        ))
                    }
                    Entry::Occupied(_) => OpResult::fail(format!(
                        "Account #{} already exists",
                        account
                    )),
                }
            }
            Operation::DeleteAccount { account } => {
                match accounts.remove(&account) {
                    Some(_) => OpResult::ok(format!(
                        "Account #{} deleted successfully",
                        account
                    )),
                    None => OpResult::fail(format!(
                        "Account #{} not found",
                        account
                    )),
                }
            }
            Operation::GetAccountInfo { account } => {
                match accounts.get(&account) {
                    Some(balance) => OpResult::ok(format!(
                        "Account #{} is open with balance ${}",
                        account, balance
                    )),
                    None => OpResult::fail(format!(
                        "Account #{} not found",
                        account
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod ledger_tests {
    use super::*;

    #[test]
    fn amount_parse_valid() -> Result<(), RelibankError> {
        assert_eq!("100".parse::<Amount>()?, Amount::from_cents(10000));
        assert_eq!("100.5".parse::<Amount>()?, Amount::from_cents(10050));
        assert_eq!("100.50".parse::<Amount>()?, Amount::from_cents(10050));
        assert_eq!("0.05".parse::<Amount>()?, Amount::from_cents(5));
        assert_eq!(".5".parse::<Amount>()?, Amount::from_cents(50));
        assert_eq!("7.".parse::<Amount>()?, Amount::from_cents(700));
        assert_eq!("-3.25".parse::<Amount>()?, Amount::from_cents(-325));
        Ok(())
    }

    #[test]
    fn amount_parse_invalid() {
        assert!("".parse::<Amount>().is_err());
        assert!("-".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
        assert!("1.234".parse::<Amount>().is_err());
        assert!("1.2x".parse::<Amount>().is_err());
    }

    #[test]
    fn amount_display() {
        assert_eq!(Amount::from_cents(10050).to_string(), "100.50");
        assert_eq!(Amount::from_cents(5).to_string(), "0.05");
        assert_eq!(Amount::from_cents(-325).to_string(), "-3.25");
        assert_eq!(Amount::ZERO.to_string(), "0.00");
    }

    #[test]
    fn amount_from_float_rounds() {
        assert_eq!(Amount::from_float(1.005), Amount::from_cents(101));
        assert_eq!(Amount::from_float(100.0), Amount::from_cents(10000));
    }

    #[test]
    fn amount_arith_exact() {
        let mut total = Amount::ZERO;
        for _ in 0..10 {
            total += Amount::from_float(0.1);
        }
        assert_eq!(total, Amount::from_float(1.0));
        total -= Amount::from_float(0.3);
        assert_eq!(total, Amount::from_float(0.7));
    }

    #[test]
    fn op_routing() {
        let deposit = Operation::Deposit {
            account: 5000,
            amount: Amount::from_cents(100),
        };
        assert_eq!(deposit.kind(), "deposit");
        assert_eq!(deposit.service_name(), ATM_SERVICE);
        let info = Operation::GetAccountInfo { account: 5000 };
        assert_eq!(info.kind(), "get_account_info");
        assert_eq!(info.service_name(), BRANCH_SERVICE);
    }

    #[test]
    fn apply_deposit() {
        let ledger = Ledger::new();
        assert!(ledger.open(5000));
        let result = ledger.apply(&Operation::Deposit {
            account: 5000,
            amount: "250.75".parse().unwrap(),
        });
        assert!(result.success);
        assert_eq!(
            result.message,
            "Deposited 250.75 successfully into account #5000"
        );
        assert_eq!(ledger.balance_of(5000), Some(Amount::from_cents(25075)));
    }

    #[test]
    fn apply_deposit_unknown_account() {
        let ledger = Ledger::new();
        let result = ledger.apply(&Operation::Deposit {
            account: 4040,
            amount: Amount::from_cents(100),
        });
        assert!(!result.success);
        assert_eq!(result.message, "Account #4040 not found");
        assert_eq!(ledger.balance_of(4040), None);
    }

    #[test]
    fn apply_withdraw_covered() {
        let ledger = Ledger::new();
        ledger.open(8080);
        ledger.apply(&Operation::Deposit {
            account: 8080,
            amount: Amount::from_cents(10000),
        });
        let result = ledger.apply(&Operation::Withdraw {
            account: 8080,
            amount: Amount::from_cents(2500),
        });
        assert!(result.success);
        assert_eq!(
            result.message,
            "Withdrew 25.00 successfully from account #8080"
        );
        assert_eq!(ledger.balance_of(8080), Some(Amount::from_cents(7500)));
    }

    #[test]
    fn apply_withdraw_insufficient() {
        let ledger = Ledger::new();
        ledger.open(8080);
        let result = ledger.apply(&Operation::Withdraw {
            account: 8080,
            amount: Amount::from_cents(1),
        });
        assert!(!result.success);
        assert_eq!(result.message, "Insufficient funds in account #8080");
        assert_eq!(ledger.balance_of(8080), Some(Amount::ZERO));
    }

    #[test]
    fn apply_withdraw_unknown_account() {
        let ledger = Ledger::new();
        let result = ledger.apply(&Operation::Withdraw {
            account: 4040,
            amount: Amount::from_cents(100),
        });
        assert!(!result.success);
        assert_eq!(result.message, "Account #4040 not found");
    }

    #[test]
    fn apply_withdraw_exact_cover() {
        let ledger = Ledger::new();
        ledger.open(8080);
        ledger.apply(&Operation::Deposit {
            account: 8080,
            amount: Amount::from_cents(500),
        });
        let result = ledger.apply(&Operation::Withdraw {
            account: 8080,
            amount: Amount::from_cents(500),
        });
        assert!(result.success);
        assert_eq!(ledger.balance_of(8080), Some(Amount::ZERO));
    }

    #[test]
    fn apply_get_balance() {
        let ledger = Ledger::new();
        ledger.open(5000);
        let result = ledger.apply(&Operation::GetBalance { account: 5000 });
        assert!(result.success);
        assert_eq!(result.message, "Balance for account #5000: $0.00");
        assert!(!ledger
            .apply(&Operation::GetBalance { account: 1 })
            .success);
    }

    #[test]
    fn apply_create_and_duplicate() {
        let ledger = Ledger::new();
        let result = ledger.apply(&Operation::CreateAccount { account: 42 });
        assert!(result.success);
        assert_eq!(result.message, "Account #42 created successfully");
        assert_eq!(ledger.balance_of(42), Some(Amount::ZERO));
        let result = ledger.apply(&Operation::CreateAccount { account: 42 });
        assert!(!result.success);
        assert_eq!(result.message, "Account #42 already exists");
    }

    #[test]
    fn apply_delete() {
        let ledger = Ledger::new();
        ledger.open(42);
        let result = ledger.apply(&Operation::DeleteAccount { account: 42 });
        assert!(result.success);
        assert_eq!(result.message, "Account #42 deleted successfully");
        assert_eq!(ledger.balance_of(42), None);
        let result = ledger.apply(&Operation::DeleteAccount { account: 42 });
        assert!(!result.success);
        assert_eq!(result.message, "Account #42 not found");
    }

    #[test]
    fn apply_account_info() {
        let ledger = Ledger::new();
        ledger.open(5000);
        ledger.apply(&Operation::Deposit {
            account: 5000,
            amount: Amount::from_cents(12345),
        });
        let result =
            ledger.apply(&Operation::GetAccountInfo { account: 5000 });
        assert!(result.success);
        assert_eq!(
            result.message,
            "Account #5000 is open with balance $123.45"
        );
        let result = ledger.apply(&Operation::GetAccountInfo { account: 2 });
        assert!(!result.success);
    }

    #[test]
    fn open_idempotent_on_balance() {
        let ledger = Ledger::new();
        assert!(ledger.open(5000));
        ledger.apply(&Operation::Deposit {
            account: 5000,
            amount: Amount::from_cents(100),
        });
        // opening again must not reset the balance
        assert!(!ledger.open(5000));
        assert_eq!(ledger.balance_of(5000), Some(Amount::from_cents(100)));
        assert_eq!(ledger.num_accounts(), 1);
    }
}
