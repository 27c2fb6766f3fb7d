//! The escrow order ledger.

use obclaim_types::{Commitment, LedgerEntry};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
	#[error("Unknown commitment: {0}")]
	UnknownCommitment(Commitment),
	#[error("Balance of {commitment} cannot drop by {amount}")]
	Underflow { commitment: Commitment, amount: u128 },
	#[error("Balance of {0} overflows")]
	Overflow(Commitment),
}

/// Signed balance change for one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCommand {
	pub commitment: Commitment,
	pub delta: i128,
}

impl LedgerCommand {
	/// A debit of `amount` ledger units.
	pub fn debit(commitment: Commitment, amount: u128) -> Result<Self, LedgerError> {
		let delta = i128::try_from(amount).map_err(|_| LedgerError::Overflow(commitment.clone()))?;
		Ok(Self {
			commitment,
			delta: -delta,
		})
	}
}

/// Known escrow positions, in the order they were configured.
///
/// Entries are never removed. A position whose balance reaches zero stays in
/// the ledger and is only hidden by [`OrderLedger::open_orders`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderLedger {
	entries: Vec<LedgerEntry>,
}

impl OrderLedger {
	pub fn new(entries: Vec<LedgerEntry>) -> Self {
		Self { entries }
	}

	pub fn get(&self, commitment: &Commitment) -> Option<&LedgerEntry> {
		self.entries.iter().find(|e| &e.commitment == commitment)
	}

	pub fn entries(&self) -> &[LedgerEntry] {
		&self.entries
	}

	/// Positions that still hold funds.
	pub fn open_orders(&self) -> Vec<LedgerEntry> {
		self.entries
			.iter()
			.filter(|e| e.balance > 0)
			.cloned()
			.collect()
	}

	/// Returns the ledger with `command` applied. `self` is left untouched.
	pub fn apply(&self, command: &LedgerCommand) -> Result<Self, LedgerError> {
		let mut entries = self.entries.clone();
		let entry = entries
			.iter_mut()
			.find(|e| e.commitment == command.commitment)
			.ok_or_else(|| LedgerError::UnknownCommitment(command.commitment.clone()))?;

		let magnitude = command.delta.unsigned_abs();
		entry.balance = if command.delta < 0 {
			entry
				.balance
				.checked_sub(magnitude)
				.ok_or_else(|| LedgerError::Underflow {
					commitment: command.commitment.clone(),
					amount: magnitude,
				})?
		} else {
			entry
				.balance
				.checked_add(magnitude)
				.ok_or_else(|| LedgerError::Overflow(command.commitment.clone()))?
		};

		Ok(Self { entries })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use obclaim_types::CurrencyCode;

	fn entry(commitment: &str, balance: u128) -> LedgerEntry {
		LedgerEntry {
			commitment: Commitment::new(commitment),
			balance,
			currency: CurrencyCode::Gbp,
			sort_code: "04-00-75".to_string(),
		}
	}

	fn ledger() -> OrderLedger {
		OrderLedger::new(vec![entry("0x01", 400_350_000), entry("0x02", 1_250_000_000)])
	}

	#[test]
	fn test_debit_reduces_only_target() {
		let ledger = ledger();
		let command = LedgerCommand::debit(Commitment::new("0x01"), 25_000_000).unwrap();

		let next = ledger.apply(&command).unwrap();
		assert_eq!(next.get(&Commitment::new("0x01")).unwrap().balance, 375_350_000);
		assert_eq!(
			next.get(&Commitment::new("0x02")).unwrap().balance,
			1_250_000_000
		);
		// The previous ledger value is unchanged.
		assert_eq!(
			ledger.get(&Commitment::new("0x01")).unwrap().balance,
			400_350_000
		);
	}

	#[test]
	fn test_credit() {
		let command = LedgerCommand {
			commitment: Commitment::new("0x02"),
			delta: 5_000_000,
		};
		let next = ledger().apply(&command).unwrap();
		assert_eq!(
			next.get(&Commitment::new("0x02")).unwrap().balance,
			1_255_000_000
		);
	}

	#[test]
	fn test_underflow_and_unknown() {
		let ledger = ledger();

		let too_much = LedgerCommand::debit(Commitment::new("0x01"), 400_350_001).unwrap();
		assert!(matches!(
			ledger.apply(&too_much),
			Err(LedgerError::Underflow { amount: 400_350_001, .. })
		));

		let unknown = LedgerCommand::debit(Commitment::new("0x99"), 1).unwrap();
		assert_eq!(
			ledger.apply(&unknown),
			Err(LedgerError::UnknownCommitment(Commitment::new("0x99")))
		);
	}

	#[test]
	fn test_drained_position_is_kept_but_not_open() {
		let command = LedgerCommand::debit(Commitment::new("0x01"), 400_350_000).unwrap();
		let next = ledger().apply(&command).unwrap();

		assert_eq!(next.entries().len(), 2);
		let open = next.open_orders();
		assert_eq!(open.len(), 1);
		assert_eq!(open[0].commitment, Commitment::new("0x02"));
	}

	#[test]
	fn test_debit_larger_than_signed_range() {
		assert!(matches!(
			LedgerCommand::debit(Commitment::new("0x01"), u128::MAX),
			Err(LedgerError::Overflow(_))
		));
	}
}
