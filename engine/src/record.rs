//! Store and payment records, and the partial field sets used to patch them.

use crate::{Month, RecordId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// A retail store visited by field staff.
///
/// `total_revenue` and `entries` are aggregates maintained incrementally by
/// the sync worker; displays derive their own totals from payments instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRecord {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub total_revenue: Decimal,
    #[serde(default)]
    pub entries: u64,
    pub created_at: Timestamp,
}

impl StoreRecord {
    /// Overwrite the editable contact fields from another record.
    pub fn overwrite_contact(&mut self, other: &StoreRecord) {
        self.name.clone_from(&other.name);
        self.owner.clone_from(&other.owner);
        self.email.clone_from(&other.email);
        self.location.clone_from(&other.location);
    }
}

/// Whether the receipt for a payment has been cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Clearance {
    #[serde(rename = "CLEARED")]
    Cleared,
    #[serde(rename = "NOT_CLEARED")]
    NotCleared,
}

/// A monthly payment collected from a store (a "transaction" remotely).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: RecordId,
    pub store_id: RecordId,
    pub sender_name: String,
    #[serde(default)]
    pub sim_cards_sold: u32,
    pub payment_amount: Decimal,
    #[serde(default)]
    pub status: String,
    pub created_at: Timestamp,
    pub transaction_month: Month,
    #[serde(default)]
    pub remark: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_collection_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clearance: Option<Clearance>,
}

impl PaymentRecord {
    /// Overwrite every mutable field from another record, keeping identity
    /// (`id`, `store_id`, `created_at`).
    pub fn overwrite_mutable(&mut self, other: &PaymentRecord) {
        self.sender_name.clone_from(&other.sender_name);
        self.sim_cards_sold = other.sim_cards_sold;
        self.payment_amount = other.payment_amount;
        self.status.clone_from(&other.status);
        self.transaction_month = other.transaction_month;
        self.remark.clone_from(&other.remark);
        self.receipt_collection_date
            .clone_from(&other.receipt_collection_date);
        self.clearance = other.clearance;
    }

    /// Uniqueness key: at most one payment per store per month.
    pub fn slot(&self) -> (&RecordId, Month) {
        (&self.store_id, self.transaction_month)
    }
}

/// A subset of store fields set by a local edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl StorePatch {
    /// Patch carrying every contact field of `record`.
    pub fn from_record(record: &StoreRecord) -> Self {
        Self {
            name: Some(record.name.clone()),
            owner: Some(record.owner.clone()),
            email: Some(record.email.clone()),
            location: Some(record.location.clone()),
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn location(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.owner.is_none()
            && self.email.is_none()
            && self.location.is_none()
    }

    /// Layer `newer` on top of this patch.
    pub fn merge(&mut self, newer: StorePatch) {
        if newer.name.is_some() {
            self.name = newer.name;
        }
        if newer.owner.is_some() {
            self.owner = newer.owner;
        }
        if newer.email.is_some() {
            self.email = newer.email;
        }
        if newer.location.is_some() {
            self.location = newer.location;
        }
    }

    /// True when every field set in the patch equals the record's value.
    pub fn matches(&self, record: &StoreRecord) -> bool {
        field_matches(&self.name, &record.name)
            && field_matches(&self.owner, &record.owner)
            && field_matches(&self.email, &record.email)
            && field_matches(&self.location, &record.location)
    }

    pub fn apply_to(&self, record: &mut StoreRecord) {
        if let Some(name) = &self.name {
            record.name.clone_from(name);
        }
        if let Some(owner) = &self.owner {
            record.owner.clone_from(owner);
        }
        if let Some(email) = &self.email {
            record.email.clone_from(email);
        }
        if let Some(location) = &self.location {
            record.location.clone_from(location);
        }
    }
}

/// A subset of payment fields set by a local edit.
///
/// `None` means "not overridden". For the optional record fields `Some(None)`
/// clears the value; it is sent as an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_cards_sold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_month: Option<Month>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub receipt_collection_date: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub clearance: Option<Option<Clearance>>,
}

/// A key that is present is an override, even when its value is `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl PaymentPatch {
    /// Patch carrying every mutable field of `record`.
    pub fn from_record(record: &PaymentRecord) -> Self {
        Self {
            sender_name: Some(record.sender_name.clone()),
            sim_cards_sold: Some(record.sim_cards_sold),
            payment_amount: Some(record.payment_amount),
            status: Some(record.status.clone()),
            transaction_month: Some(record.transaction_month),
            remark: Some(record.remark.clone()),
            receipt_collection_date: Some(record.receipt_collection_date.clone()),
            clearance: Some(record.clearance),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == PaymentPatch::default()
    }

    /// Layer `newer` on top of this patch.
    pub fn merge(&mut self, newer: PaymentPatch) {
        if newer.sender_name.is_some() {
            self.sender_name = newer.sender_name;
        }
        if newer.sim_cards_sold.is_some() {
            self.sim_cards_sold = newer.sim_cards_sold;
        }
        if newer.payment_amount.is_some() {
            self.payment_amount = newer.payment_amount;
        }
        if newer.status.is_some() {
            self.status = newer.status;
        }
        if newer.transaction_month.is_some() {
            self.transaction_month = newer.transaction_month;
        }
        if newer.remark.is_some() {
            self.remark = newer.remark;
        }
        if newer.receipt_collection_date.is_some() {
            self.receipt_collection_date = newer.receipt_collection_date;
        }
        if newer.clearance.is_some() {
            self.clearance = newer.clearance;
        }
    }

    /// True when every field set in the patch equals the record's value.
    pub fn matches(&self, record: &PaymentRecord) -> bool {
        field_matches(&self.sender_name, &record.sender_name)
            && field_matches(&self.sim_cards_sold, &record.sim_cards_sold)
            && field_matches(&self.payment_amount, &record.payment_amount)
            && field_matches(&self.status, &record.status)
            && field_matches(&self.transaction_month, &record.transaction_month)
            && field_matches(&self.remark, &record.remark)
            && field_matches(&self.receipt_collection_date, &record.receipt_collection_date)
            && field_matches(&self.clearance, &record.clearance)
    }

    pub fn apply_to(&self, record: &mut PaymentRecord) {
        if let Some(sender_name) = &self.sender_name {
            record.sender_name.clone_from(sender_name);
        }
        if let Some(sims) = self.sim_cards_sold {
            record.sim_cards_sold = sims;
        }
        if let Some(amount) = self.payment_amount {
            record.payment_amount = amount;
        }
        if let Some(status) = &self.status {
            record.status.clone_from(status);
        }
        if let Some(month) = self.transaction_month {
            record.transaction_month = month;
        }
        if let Some(remark) = &self.remark {
            record.remark.clone_from(remark);
        }
        if let Some(date) = &self.receipt_collection_date {
            record.receipt_collection_date.clone_from(date);
        }
        if let Some(clearance) = self.clearance {
            record.clearance = clearance;
        }
    }
}

fn field_matches<T: PartialEq>(patch: &Option<T>, value: &T) -> bool {
    patch.as_ref().map_or(true, |v| v == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payment() -> PaymentRecord {
        PaymentRecord {
            id: RecordId::remote("p-1"),
            store_id: RecordId::remote("s-1"),
            sender_name: "Ama".into(),
            sim_cards_sold: 10,
            payment_amount: Decimal::from(1000),
            status: "completed".into(),
            created_at: 1000,
            transaction_month: Month::March,
            remark: String::new(),
            receipt_collection_date: None,
            clearance: Some(Clearance::NotCleared),
        }
    }

    #[test]
    fn payment_wire_format() {
        let value = serde_json::to_value(payment()).unwrap();
        assert_eq!(value["storeId"], json!("s-1"));
        assert_eq!(value["transactionMonth"], json!("March"));
        assert_eq!(value["paymentAmount"], json!("1000"));
        assert_eq!(value["clearance"], json!("NOT_CLEARED"));
        assert!(value.get("receiptCollectionDate").is_none());
    }

    #[test]
    fn payment_accepts_numeric_amounts() {
        let parsed: PaymentRecord = serde_json::from_value(json!({
            "id": "p-9",
            "storeId": "s-1",
            "senderName": "Kofi",
            "simCardsSold": 3,
            "paymentAmount": 2500.50,
            "status": "completed",
            "createdAt": 5,
            "transactionMonth": "April",
            "remark": "late"
        }))
        .unwrap();
        assert_eq!(parsed.payment_amount, Decimal::new(250050, 2));
        assert_eq!(parsed.clearance, None);
    }

    #[test]
    fn overwrite_keeps_identity() {
        let mut target = payment();
        let mut source = payment();
        source.id = RecordId::local("x");
        source.store_id = RecordId::remote("other");
        source.payment_amount = Decimal::from(1500);
        source.transaction_month = Month::May;

        target.overwrite_mutable(&source);
        assert_eq!(target.id, RecordId::remote("p-1"));
        assert_eq!(target.store_id, RecordId::remote("s-1"));
        assert_eq!(target.payment_amount, Decimal::from(1500));
        assert_eq!(target.transaction_month, Month::May);
    }

    #[test]
    fn payment_patch_matching_is_exact() {
        let record = payment();
        let mut patch = PaymentPatch {
            payment_amount: Some(Decimal::from(1000)),
            ..PaymentPatch::default()
        };
        assert!(patch.matches(&record));

        patch.payment_amount = Some(Decimal::new(100001, 2));
        assert!(!patch.matches(&record));

        assert!(PaymentPatch::from_record(&record).matches(&record));
    }

    #[test]
    fn payment_patch_clears_optional_fields() {
        let mut remote = payment();
        remote.receipt_collection_date = Some("2024-03-05".into());
        remote.clearance = Some(Clearance::Cleared);

        let mut edit = remote.clone();
        edit.receipt_collection_date = None;
        edit.clearance = None;
        let patch = PaymentPatch::from_record(&edit);
        assert!(!patch.matches(&remote));

        patch.apply_to(&mut remote);
        assert_eq!(remote.receipt_collection_date, None);
        assert_eq!(remote.clearance, None);
        assert!(patch.matches(&remote));
    }

    #[test]
    fn payment_patch_keeps_explicit_nulls() {
        let patch = PaymentPatch {
            receipt_collection_date: Some(None),
            ..PaymentPatch::default()
        };
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(value, json!({ "receiptCollectionDate": null }));

        let parsed: PaymentPatch = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, patch);
        assert!(!parsed.is_empty());

        let untouched: PaymentPatch = serde_json::from_value(json!({})).unwrap();
        assert_eq!(untouched.clearance, None);
    }

    #[test]
    fn store_patch_merge_and_apply() {
        let mut patch = StorePatch::name("Kiosk A");
        patch.merge(StorePatch::location("Accra"));
        patch.merge(StorePatch::name("Kiosk B"));

        let mut record = StoreRecord {
            id: RecordId::remote("s-1"),
            name: "old".into(),
            owner: "Efua".into(),
            email: String::new(),
            location: String::new(),
            total_revenue: Decimal::ZERO,
            entries: 0,
            created_at: 0,
        };
        assert!(!patch.matches(&record));

        patch.apply_to(&mut record);
        assert_eq!(record.name, "Kiosk B");
        assert_eq!(record.location, "Accra");
        assert_eq!(record.owner, "Efua");
        assert!(patch.matches(&record));
    }
}
