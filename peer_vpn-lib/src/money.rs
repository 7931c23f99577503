use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};

/// Smallest accounting unit: 1 token == 10^8 units.
const UNITS_PER_TOKEN: f64 = 100_000_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Currency(pub &'static str);

pub const CURRENCY_PEER: Currency = Currency("PEER");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Money {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub amount: u64,
    #[serde(default, skip_serializing_if = "currency_is_empty")]
    pub currency: String,
}

fn is_zero(amount: &u64) -> bool {
    *amount == 0
}

fn currency_is_empty(currency: &String) -> bool {
    currency.is_empty()
}

impl Money {
    pub fn new(tokens: f64, currency: Currency) -> Self {
        Money {
            amount: (tokens * UNITS_PER_TOKEN) as u64,
            currency: currency.0.to_string(),
        }
    }

    pub fn zero(currency: Currency) -> Self {
        Money::new(0.0, currency)
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
