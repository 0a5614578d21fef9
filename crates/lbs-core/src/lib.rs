//! Core domain model for LBS.
//!
//! Everything here is ephemeral: created fresh each reconciliation pass and
//! discarded once the destination writes complete.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lbs-core";

/// One lease with an outstanding balance, as reported by the upstream API.
///
/// The lease id is opaque but stable and unique per lease. Amounts are signed
/// decimals; the wire format carries them as JSON numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutstandingBalance {
    pub lease_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

/// Supplementary descriptive fields fetched only for leases not yet present
/// in the sheet. A lease without tenants, phone numbers, or an address yields
/// empty strings, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeaseDetails {
    pub tenant_name: String,
    pub phone_number: String,
    pub address: String,
}

/// Overwrite of the amount cell of an existing sheet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub row: u32,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

/// A lease to append to the sheet, with its enriched details.
///
/// Rendering into the fixed-width cell layout lives with the destination
/// client, which owns the column contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRow {
    pub lease_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub details: LeaseDetails,
}
