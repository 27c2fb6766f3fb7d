//! Fixed-point token amounts.
//!
//! Amounts are kept as the decimal string the user typed and only turned
//! into the ledger's integer representation where they leave the process:
//! when authorization is requested and when the wallet is credited.

use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

/// Number of fractional digits of the ledger token.
pub const LEDGER_DECIMALS: u32 = 6;

/// Number of fractional digits a transfer amount may carry.
pub const TRANSFER_DECIMALS: u32 = 2;

const UNIT: u128 = 10u128.pow(LEDGER_DECIMALS);

/// Errors produced while parsing a user supplied amount.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
	#[error("Amount is empty")]
	Empty,
	#[error("Amount is not a number: {0}")]
	NotANumber(String),
	#[error("Amount must not be negative")]
	Negative,
	#[error("Amount must be greater than zero")]
	Zero,
	#[error("Amount has more than {0} fractional digits")]
	TooPrecise(u32),
	#[error("Amount does not fit the ledger")]
	Overflow,
}

/// Converts a decimal string into ledger units.
///
/// `"25.00"` becomes `25_000_000`. Zero is accepted here; use
/// [`parse_transfer_amount`] when the value is about to be paid.
pub fn to_ledger_units(amount: &str) -> Result<u128, AmountError> {
	let trimmed = amount.trim();
	if trimmed.is_empty() {
		return Err(AmountError::Empty);
	}

	let value = Decimal::from_str(trimmed)
		.map_err(|_| AmountError::NotANumber(trimmed.to_string()))?;
	if value.is_sign_negative() && !value.is_zero() {
		return Err(AmountError::Negative);
	}

	let mut normalized = value.normalize();
	if normalized.scale() > LEDGER_DECIMALS {
		return Err(AmountError::TooPrecise(LEDGER_DECIMALS));
	}
	normalized.rescale(LEDGER_DECIMALS);

	u128::try_from(normalized.mantissa()).map_err(|_| AmountError::Overflow)
}

/// Parses an amount that is about to be transferred. Must be non-zero and
/// carry at most [`TRANSFER_DECIMALS`] fractional digits.
pub fn parse_transfer_amount(amount: &str) -> Result<u128, AmountError> {
	let units = to_ledger_units(amount)?;
	if units % 10u128.pow(LEDGER_DECIMALS - TRANSFER_DECIMALS) != 0 {
		return Err(AmountError::TooPrecise(TRANSFER_DECIMALS));
	}

	match units {
		0 => Err(AmountError::Zero),
		units => Ok(units),
	}
}

/// Renders ledger units with thousands separators, e.g. `1,234.5`.
pub fn format_units(units: u128) -> String {
	let integer = (units / UNIT).to_string();
	let mut grouped = String::with_capacity(integer.len() + integer.len() / 3);
	for (i, ch) in integer.chars().enumerate() {
		if i > 0 && (integer.len() - i) % 3 == 0 {
			grouped.push(',');
		}
		grouped.push(ch);
	}

	let fraction = fraction_digits(units);
	if fraction.is_empty() {
		grouped
	} else {
		format!("{}.{}", grouped, fraction)
	}
}

/// Renders ledger units as a plain decimal with at least `min_fraction`
/// fractional digits, e.g. `25.00`. Used for bank-facing amounts.
pub fn format_decimal(units: u128, min_fraction: usize) -> String {
	let mut fraction = fraction_digits(units);
	while fraction.len() < min_fraction.min(LEDGER_DECIMALS as usize) {
		fraction.push('0');
	}

	if fraction.is_empty() {
		(units / UNIT).to_string()
	} else {
		format!("{}.{}", units / UNIT, fraction)
	}
}

fn fraction_digits(units: u128) -> String {
	let padded = format!("{:0width$}", units % UNIT, width = LEDGER_DECIMALS as usize);
	padded.trim_end_matches('0').to_string()
}
