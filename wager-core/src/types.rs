use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Amount;

/// Outcome of a wager as reported by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Win,
    Lose,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("state {0} is not supported")]
pub struct UnsupportedState(pub String);

impl TxState {
    pub fn as_str(self) -> &'static str {
        match self {
            TxState::Win => "win",
            TxState::Lose => "lose",
        }
    }

    /// Signed balance delta produced by applying `amount` in this state.
    pub fn effect(self, amount: Amount) -> Amount {
        match self {
            TxState::Win => amount,
            TxState::Lose => -amount,
        }
    }

    /// Delta that undoes [`TxState::effect`].
    pub fn reversal(self, amount: Amount) -> Amount {
        -self.effect(amount)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxState {
    type Err = UnsupportedState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "win" => Ok(TxState::Win),
            "lose" => Ok(TxState::Lose),
            other => Err(UnsupportedState(other.to_string())),
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Routing key used to locate an account (e.g. a phone number).
    AccountKey
);

string_id!(
    /// Caller-supplied, globally unique transaction identifier.
    TransactionId
);
