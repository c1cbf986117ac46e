use std::fmt;

/// Ledger failures. `InsufficientFunds` and `AccountMissing` map onto the
/// zero-rows-updated outcomes of the conditional statements in `bank.rs`.
#[derive(Debug)]
pub(crate) enum BankError {
    AccountMissing,
    InsufficientFunds,
    InvalidAmount,
    WithdrawFailed(anyhow::Error),
    Db(sqlx::Error),
}

impl fmt::Display for BankError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankError::AccountMissing => write!(f, "balance record not found"),
            BankError::InsufficientFunds => write!(f, "insufficient funds"),
            BankError::InvalidAmount => write!(f, "amount must be strictly positive"),
            BankError::WithdrawFailed(e) => write!(f, "unable to withdraw balance: {e}"),
            BankError::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for BankError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BankError::Db(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for BankError {
    fn from(e: sqlx::Error) -> Self {
        BankError::Db(e)
    }
}

/// Round engine failures surfaced through the client ack; never fatal.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GameError {
    WrongState,
    AlreadyJoined,
    NotWaiting,
    NotPlaying,
    AlreadyCashedOut,
    InsufficientFunds,
}

impl GameError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            GameError::WrongState => "WRONG_STATE",
            GameError::AlreadyJoined => "ALREADY_JOINED",
            GameError::NotWaiting => "NOT_WAITING",
            GameError::NotPlaying => "NOT_PLAYING",
            GameError::AlreadyCashedOut => "ALREADY_CASHED_OUT",
            GameError::InsufficientFunds => "INSUFFICIENT_BALANCE",
        }
    }
}

impl fmt::Display for GameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameError::WrongState => write!(f, "action invalid for current game state"),
            GameError::AlreadyJoined => write!(f, "user already joined game"),
            GameError::NotWaiting => write!(f, "user not in waiting list"),
            GameError::NotPlaying => write!(f, "user not playing"),
            GameError::AlreadyCashedOut => write!(f, "player already cashed out"),
            GameError::InsufficientFunds => write!(f, "insufficient funds"),
        }
    }
}

impl std::error::Error for GameError {}

#[derive(Debug)]
pub(crate) enum WithdrawError {
    InsufficientFunds,
    Bank(BankError),
    Signing(anyhow::Error),
}

impl WithdrawError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            WithdrawError::InsufficientFunds => "INSUFFICIENT_BALANCE",
            WithdrawError::Bank(BankError::InsufficientFunds) => "INSUFFICIENT_BALANCE",
            WithdrawError::Bank(_) => "WITHDRAW_FAILED",
            WithdrawError::Signing(_) => "WITHDRAW_FAILED",
        }
    }
}

impl fmt::Display for WithdrawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WithdrawError::InsufficientFunds => write!(f, "insufficient funds"),
            WithdrawError::Bank(e) => write!(f, "withdrawal failed: {e}"),
            WithdrawError::Signing(e) => write!(f, "signing failed: {e}"),
        }
    }
}

impl std::error::Error for WithdrawError {}

impl From<BankError> for WithdrawError {
    fn from(e: BankError) -> Self {
        match e {
            BankError::InsufficientFunds => WithdrawError::InsufficientFunds,
            other => WithdrawError::Bank(other),
        }
    }
}
