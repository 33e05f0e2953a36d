//! The draft confirm state machine and the TTL-based draft cleanup sweeper.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use sbm_common::error::{CoreError, CoreErrorKind};
use sbm_common::shutdown::ShutdownChannel;
use sbm_common::task::CoreTask;
use sbm_common::time::TimestampMillis;

use crate::dedup::{self, DuplicateOutcome};
use crate::model::{DedupStatus, Invoice, Payment};
use crate::store::Store;

/// Confirm a draft payment. `force_duplicate_save` overrides a suspect (but
/// never a hash) duplicate.
pub async fn confirm_payment(
    store: &dyn Store,
    mut payment: Payment,
    force_duplicate_save: bool,
) -> Result<Payment, CoreError> {
    let Some(ts) = payment.transaction_time_ts else {
        return Err(CoreError::new(
            CoreErrorKind::MissingTransactionTime,
            "payment has no transaction_time_ts; caller must supply one before confirming",
        ));
    };

    let outcome = dedup::check_payment_duplicate(
        store,
        payment.owner,
        payment.id,
        payment.amount,
        ts,
        payment.file_sha256.as_deref(),
    )
    .await?;

    apply_outcome(&mut payment.dedup_status, &mut payment.dedup_ref_id, outcome, force_duplicate_save)?;
    payment.is_draft = false;
    store.put_payment(payment.clone()).await?;
    Ok(payment)
}

/// Confirm a draft invoice. Same shape as [`confirm_payment`], keyed on
/// `invoice_number` instead of amount+time.
pub async fn confirm_invoice(
    store: &dyn Store,
    mut invoice: Invoice,
    force_duplicate_save: bool,
) -> Result<Invoice, CoreError> {
    let outcome = dedup::check_invoice_duplicate(
        store,
        invoice.owner,
        invoice.id,
        invoice.invoice_number.as_deref(),
        invoice.file_sha256.as_deref(),
    )
    .await?;

    apply_outcome(&mut invoice.dedup_status, &mut invoice.dedup_ref_id, outcome, force_duplicate_save)?;
    invoice.is_draft = false;
    store.put_invoice(invoice.clone()).await?;
    Ok(invoice)
}

fn apply_outcome<T: HasId>(
    dedup_status: &mut DedupStatus,
    dedup_ref_id: &mut Option<Uuid>,
    outcome: DuplicateOutcome<T>,
    force_duplicate_save: bool,
) -> Result<(), CoreError> {
    match outcome {
        DuplicateOutcome::HashDuplicate { existing_id, existing_is_draft } => {
            Err(CoreError::new(
                CoreErrorKind::DuplicateHash,
                format!(
                    "hash duplicate of {existing_id} (draft={existing_is_draft}); not overridable"
                ),
            ))
        }
        DuplicateOutcome::Suspected { candidates } if !force_duplicate_save => {
            Err(CoreError::new(
                CoreErrorKind::DuplicateSuspect,
                format!("{} suspected duplicate candidate(s)", candidates.len()),
            ))
        }
        DuplicateOutcome::Suspected { candidates } => {
            *dedup_status = DedupStatus::Forced;
            *dedup_ref_id = first_id(&candidates);
            Ok(())
        }
        DuplicateOutcome::Clean => {
            *dedup_status = DedupStatus::Ok;
            Ok(())
        }
    }
}

/// Both `Invoice` and `Payment` carry an `id: Uuid` field; this trait lets
/// `apply_outcome` stay generic over either.
trait HasId {
    fn id(&self) -> Uuid;
}
impl HasId for Invoice {
    fn id(&self) -> Uuid {
        self.id
    }
}
impl HasId for Payment {
    fn id(&self) -> Uuid {
        self.id
    }
}

fn first_id<T: HasId>(candidates: &[T]) -> Option<Uuid> {
    candidates.first().map(HasId::id)
}

/// Every `SBM_DRAFT_CLEANUP_INTERVAL_MINUTES`, delete drafts older than
/// `SBM_DRAFT_TTL_HOURS`, along with their files and invoice-payment links.
pub fn spawn_cleanup_sweeper(
    store: Arc<dyn Store>,
    uploads_dir: String,
    interval: Duration,
    ttl: Duration,
    mut shutdown: ShutdownChannel,
) -> CoreTask<()> {
    CoreTask::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_once(&store, &uploads_dir, ttl).await {
                        warn!(error = %e, "draft cleanup sweep failed");
                    }
                }
            }
        }
    })
}

async fn sweep_once(
    store: &Arc<dyn Store>,
    uploads_dir: &str,
    ttl: Duration,
) -> Result<(), CoreError> {
    let cutoff = TimestampMillis::now().as_i64() - ttl.as_millis() as i64;
    let mut removed = 0u32;

    for invoice in store.list_stale_draft_invoices(cutoff).await? {
        let file = crate::path::resolve(uploads_dir, &invoice.file_path);
        if let Err(e) = tokio::fs::remove_file(&file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, path = %file.display(), "failed to remove draft invoice file");
            }
        }
        for link in store.links_for_invoice(invoice.id).await? {
            store.unlink_invoice_payment(link).await?;
        }
        store.delete_invoice(invoice.id).await?;
        removed += 1;
    }

    for payment in store.list_stale_draft_payments(cutoff).await? {
        if let Some(screenshot_path) = &payment.screenshot_path {
            let file = crate::path::resolve(uploads_dir, screenshot_path);
            if let Err(e) = tokio::fs::remove_file(&file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, path = %file.display(), "failed to remove draft payment screenshot");
                }
            }
        }
        for link in store.links_for_payment(payment.id).await? {
            store.unlink_invoice_payment(link).await?;
        }
        store.delete_payment(payment.id).await?;
        removed += 1;
    }

    info!(removed, "draft cleanup sweep complete");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{InvoiceSource, ParseStatus, TripAssignmentSource, TripAssignmentState};
    use crate::store::memory::MemoryStore;

    fn draft_payment(owner: Uuid) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            owner,
            is_draft: true,
            amount: 42.0,
            merchant: Some("Cafe".to_string()),
            category: None,
            payment_method: None,
            description: None,
            transaction_time: Some("2025-01-01T00:00:00Z".to_string()),
            transaction_time_ts: Some(TimestampMillis::now()),
            screenshot_path: None,
            file_sha256: None,
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

    fn draft_invoice(owner: Uuid) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            owner,
            is_draft: true,
            payment_id: None,
            filename: "f.pdf".to_string(),
            original_name: "f.pdf".to_string(),
            file_path: "owner/f.pdf".to_string(),
            file_size: 10,
            file_sha256: None,
            invoice_number: Some("INV-1".to_string()),
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
    async fn clean_confirm_sets_ok_and_clears_draft() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let payment = draft_payment(owner);
        let confirmed = confirm_payment(&store, payment, false).await.unwrap();
        assert!(!confirmed.is_draft);
        assert_eq!(confirmed.dedup_status, DedupStatus::Ok);
    }

    #[tokio::test]
    async fn suspect_without_force_is_rejected_then_succeeds_forced() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();

        let mut existing = draft_invoice(owner);
        existing.is_draft = false;
        let existing_id = existing.id;
        store.put_invoice(existing).await.unwrap();

        let draft = draft_invoice(owner);
        let draft_id = draft.id;
        let rejected = confirm_invoice(&store, draft.clone(), false).await;
        assert!(matches!(
            rejected,
            Err(ref e) if e.kind == CoreErrorKind::DuplicateSuspect
        ));

        let mut draft_again = draft.clone();
        draft_again.id = draft_id;
        let confirmed = confirm_invoice(&store, draft_again, true).await.unwrap();
        assert_eq!(confirmed.dedup_status, DedupStatus::Forced);
        assert_eq!(confirmed.dedup_ref_id, Some(existing_id));
    }

    #[tokio::test]
    async fn sweep_removes_stale_drafts_only() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let owner = Uuid::new_v4();

        let mut stale = draft_invoice(owner);
        stale.created_at = TimestampMillis::from_millis_checked(0).unwrap();
        let stale_id = stale.id;
        store.put_invoice(stale).await.unwrap();

        let fresh = draft_invoice(owner);
        let fresh_id = fresh.id;
        store.put_invoice(fresh).await.unwrap();

        let cutoff = TimestampMillis::now().as_i64() - 1000;
        let stale_rows = store.list_stale_draft_invoices(cutoff).await.unwrap();
        assert_eq!(stale_rows.len(), 1);
        assert_eq!(stale_rows[0].id, stale_id);

        sweep_once(&store, "/tmp/sbm-test-uploads", Duration::from_millis(1000))
            .await
            .unwrap();

        assert!(store.get_invoice(stale_id).await.unwrap().is_none());
        assert!(store.get_invoice(fresh_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_transaction_time_blocks_confirm() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let mut payment = draft_payment(owner);
        payment.transaction_time_ts = None;
        let err = confirm_payment(&store, payment, false).await.unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::MissingTransactionTime);
    }
}
