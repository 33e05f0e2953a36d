//! Hash-duplicate and suspected-duplicate lookups shared by the invoice and
//! payment confirm paths.

use uuid::Uuid;

use sbm_common::error::CoreError;
use sbm_common::time::TimestampMillis;

use crate::model::Invoice;
use crate::model::Payment;
use crate::store::Store;

/// ±0.01 around the reference amount.
pub const AMOUNT_EPSILON: f64 = 0.01;
/// ±5 minutes around the reference instant.
pub const TIME_WINDOW_MS: i64 = 5 * 60 * 1000;
/// At most this many suspect candidates are surfaced to the caller.
pub const MAX_SUSPECT_CANDIDATES: usize = 5;

#[derive(Debug, Clone)]
pub enum DuplicateOutcome<T> {
    /// No hash or suspect duplicate; safe to confirm.
    Clean,
    /// A non-overridable hash duplicate exists.
    HashDuplicate { existing_id: Uuid, existing_is_draft: bool },
    /// Overridable suspects exist; confirm must pass `force_duplicate_save`.
    Suspected { candidates: Vec<T> },
}

/// Step 1-2 of the confirm algorithm for a payment: hash check (hard), then
/// amount+time suspect check (soft, overridable).
pub async fn check_payment_duplicate(
    store: &dyn Store,
    owner: Uuid,
    payment_id: Uuid,
    amount: f64,
    transaction_time_ts: TimestampMillis,
    file_sha256: Option<&str>,
) -> Result<DuplicateOutcome<Payment>, CoreError> {
    if let Some(hash) = file_sha256 {
        if let Some(existing) = store.find_payment_by_hash(owner, hash, Some(payment_id)).await? {
            return Ok(DuplicateOutcome::HashDuplicate {
                existing_id: existing.id,
                existing_is_draft: existing.is_draft,
            });
        }
    }
    let mut candidates = store
        .find_payments_by_amount_and_time(owner, amount, transaction_time_ts.as_i64(), Some(payment_id))
        .await?;
    candidates.truncate(MAX_SUSPECT_CANDIDATES);
    if candidates.is_empty() {
        Ok(DuplicateOutcome::Clean)
    } else {
        Ok(DuplicateOutcome::Suspected { candidates })
    }
}

/// Step 1-2 of the confirm algorithm for an invoice: hash check (hard), then
/// invoice-number suspect check (soft, overridable).
pub async fn check_invoice_duplicate(
    store: &dyn Store,
    owner: Uuid,
    invoice_id: Uuid,
    invoice_number: Option<&str>,
    file_sha256: Option<&str>,
) -> Result<DuplicateOutcome<Invoice>, CoreError> {
    if let Some(hash) = file_sha256 {
        if let Some(existing) = store.find_invoice_by_hash(owner, hash, Some(invoice_id)).await? {
            return Ok(DuplicateOutcome::HashDuplicate {
                existing_id: existing.id,
                existing_is_draft: existing.is_draft,
            });
        }
    }
    let Some(invoice_number) = invoice_number else {
        return Ok(DuplicateOutcome::Clean);
    };
    let mut candidates = store
        .find_invoices_by_number(owner, invoice_number, Some(invoice_id))
        .await?;
    candidates.truncate(MAX_SUSPECT_CANDIDATES);
    if candidates.is_empty() {
        Ok(DuplicateOutcome::Clean)
    } else {
        Ok(DuplicateOutcome::Suspected { candidates })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{DedupStatus, InvoiceSource, ParseStatus, TripAssignmentSource, TripAssignmentState};
    use crate::store::memory::MemoryStore;

    fn sample_payment(owner: Uuid, amount: f64, ts: TimestampMillis, sha: Option<&str>) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            owner,
            is_draft: false,
            amount,
            merchant: None,
            category: None,
            payment_method: None,
            description: None,
            transaction_time: None,
            transaction_time_ts: Some(ts),
            screenshot_path: None,
            file_sha256: sha.map(str::to_string),
            extracted_data: serde_json::Value::Null,
            dedup_status: DedupStatus::Ok,
            dedup_ref_id: None,
            trip_id: None,
            trip_assignment_source: TripAssignmentSource::Auto,
            trip_assignment_state: TripAssignmentState::NoMatch,
            bad_debt: false,
            created_at: TimestampMillis::now(),
        }
    }

    fn sample_invoice(owner: Uuid, invoice_number: Option<&str>, sha: Option<&str>) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            owner,
            is_draft: false,
            payment_id: None,
            filename: "f.pdf".to_string(),
            original_name: "f.pdf".to_string(),
            file_path: "owner/f.pdf".to_string(),
            file_size: 10,
            file_sha256: sha.map(str::to_string),
            invoice_number: invoice_number.map(str::to_string),
            invoice_date: None,
            amount: None,
            tax_amount: None,
            seller_name: None,
            buyer_name: None,
            extracted_data: serde_json::Value::Null,
            parse_status: ParseStatus::Success,
            parse_error: None,
            raw_text: None,
            source: InvoiceSource::Upload,
            dedup_status: DedupStatus::Ok,
            dedup_ref_id: None,
            bad_debt: false,
            created_at: TimestampMillis::now(),
        }
    }

    #[tokio::test]
    async fn hash_duplicate_blocks_regardless_of_suspect_window() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let existing = sample_payment(owner, 100.0, TimestampMillis::now(), Some("H"));
        let existing_id = existing.id;
        store.put_payment(existing).await.unwrap();

        let draft_id = Uuid::new_v4();
        let outcome = check_payment_duplicate(
            &store,
            owner,
            draft_id,
            999.0,
            TimestampMillis::now(),
            Some("H"),
        )
        .await
        .unwrap();
        match outcome {
            DuplicateOutcome::HashDuplicate { existing_id: id, existing_is_draft } => {
                assert_eq!(id, existing_id);
                assert!(!existing_is_draft);
            }
            other => panic!("expected HashDuplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoice_number_match_is_a_suspect_not_a_block() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let existing = sample_invoice(owner, Some("25317000003387982028"), None);
        store.put_invoice(existing).await.unwrap();

        let draft_id = Uuid::new_v4();
        let outcome = check_invoice_duplicate(
            &store,
            owner,
            draft_id,
            Some("25317000003387982028"),
            None,
        )
        .await
        .unwrap();
        match outcome {
            DuplicateOutcome::Suspected { candidates } => assert_eq!(candidates.len(), 1),
            other => panic!("expected Suspected, got {other:?}"),
        }
    }
}
