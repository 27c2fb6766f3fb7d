//! Order ledger types.
//!
//! A ledger entry is one counterpart escrow position: funds held against a
//! bank account and referenced on chain by a hash commitment.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::format_units;

/// Hash commitment identifying an escrow position.
///
/// Kept as the decimal rendering of the field element so that it can be
/// compared and echoed without any arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commitment(pub String);

impl Commitment {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Abbreviated form used in logs and listings, e.g. `123456…3456`.
	pub fn short(&self) -> String {
		if self.0.len() <= 10 || !self.0.is_ascii() {
			self.0.clone()
		} else {
			format!("{}…{}", &self.0[..6], &self.0[self.0.len() - 4..])
		}
	}
}

impl fmt::Display for Commitment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Fiat currency of an escrow position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CurrencyCode {
	Gbp,
	Usd,
	Eur,
}

impl CurrencyCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Gbp => "GBP",
			Self::Usd => "USD",
			Self::Eur => "EUR",
		}
	}

	pub fn symbol(&self) -> &'static str {
		match self {
			Self::Gbp => "£",
			Self::Usd => "$",
			Self::Eur => "€",
		}
	}
}

impl fmt::Display for CurrencyCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One known counterpart escrow position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
	/// Commitment of the position; the correlation key sessions refer to.
	pub commitment: Commitment,
	/// Remaining balance in ledger units.
	pub balance: u128,
	/// Currency the creditor is paid in.
	pub currency: CurrencyCode,
	/// Sort code and account number of the creditor account.
	pub sort_code: String,
}

impl LedgerEntry {
	/// Balance rendered for display, e.g. `£400.35`.
	pub fn display_balance(&self) -> String {
		format!("{}{}", self.currency.symbol(), format_units(self.balance))
	}
}

/// Balances of the connected wallet, in ledger units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
	pub private: u128,
	pub public: u128,
}
