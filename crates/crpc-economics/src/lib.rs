pub mod balance;
pub mod error;
pub mod ledger;
pub mod types;

pub use balance::{AccountInfo, BalanceManager};
pub use error::{LedgerError, Result};
pub use ledger::{LedgerOp, TokenLedger};
pub use types::{TokenAmount, BASIS_POINTS, TOKEN_BASE_UNIT, TOKEN_DECIMALS};
