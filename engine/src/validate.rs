//! Validation of user input before it is queued.
//!
//! Drafts are what forms submit. A draft that fails validation is rejected
//! synchronously and never reaches a queue.

use crate::{
    error::Result, Clearance, Error, Month, PaymentRecord, RecordId, StoreRecord, Timestamp,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Status given to payments submitted without one.
pub const DEFAULT_STATUS: &str = "completed";

/// Input for a new store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDraft {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub location: String,
}

impl StoreDraft {
    pub fn validate(&self) -> Result<()> {
        require(&self.name, "name")?;
        validate_email(&self.email)
    }

    /// Validate and build a record with zero aggregates.
    pub fn into_record(self, id: RecordId, created_at: Timestamp) -> Result<StoreRecord> {
        self.validate()?;
        Ok(StoreRecord {
            id,
            name: self.name.trim().to_string(),
            owner: self.owner.trim().to_string(),
            email: self.email.trim().to_string(),
            location: self.location.trim().to_string(),
            total_revenue: Decimal::ZERO,
            entries: 0,
            created_at,
        })
    }
}

/// Input for a payment create or edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDraft {
    pub store_id: RecordId,
    pub sender_name: String,
    #[serde(default)]
    pub sim_cards_sold: u32,
    pub payment_amount: Decimal,
    #[serde(default)]
    pub status: Option<String>,
    pub transaction_month: Month,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub receipt_collection_date: Option<String>,
    #[serde(default)]
    pub clearance: Option<Clearance>,
}

impl PaymentDraft {
    pub fn validate(&self) -> Result<()> {
        require(&self.sender_name, "senderName")?;
        if self.payment_amount <= Decimal::ZERO {
            return Err(Error::NonPositiveAmount(self.payment_amount.to_string()));
        }
        Ok(())
    }

    /// Validate and build a record.
    pub fn into_record(self, id: RecordId, created_at: Timestamp) -> Result<PaymentRecord> {
        self.validate()?;
        let status = self
            .status
            .map(|status| status.trim().to_string())
            .filter(|status| !status.is_empty())
            .unwrap_or_else(|| DEFAULT_STATUS.to_string());

        Ok(PaymentRecord {
            id,
            store_id: self.store_id,
            sender_name: self.sender_name.trim().to_string(),
            sim_cards_sold: self.sim_cards_sold,
            payment_amount: self.payment_amount.normalize(),
            status,
            created_at,
            transaction_month: self.transaction_month,
            remark: self.remark,
            receipt_collection_date: self
                .receipt_collection_date
                .filter(|date| !date.trim().is_empty()),
            clearance: self.clearance,
        })
    }
}

fn require(value: &str, field: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::MissingRequiredField(field));
    }
    Ok(())
}

/// Empty is allowed; anything else needs a local part and a domain.
fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    if email.is_empty() {
        return Ok(());
    }
    match email.split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(())
        }
        _ => Err(Error::InvalidEmail(email.to_string())),
    }
}
