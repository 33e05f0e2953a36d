//! Trip auto-assignment state machine and the bad-debt trip lock.

use uuid::Uuid;

use sbm_common::error::{CoreError, CoreErrorKind};
use sbm_common::time::TimestampMillis;

use crate::model::{Payment, Trip, TripAssignmentSource, TripAssignmentState, TripSummary};
use crate::store::Store;

/// Aggregate one trip's member payments into a [`TripSummary`].
pub async fn summary(store: &dyn Store, trip: Trip) -> Result<TripSummary, CoreError> {
    let members: Vec<Payment> = store
        .list_payments(trip.owner)
        .await?
        .into_iter()
        .filter(|p| p.trip_id == Some(trip.id))
        .collect();
    let total_amount = members.iter().map(|p| p.amount).sum();
    let bad_debt_amount = members.iter().filter(|p| p.bad_debt).map(|p| p.amount).sum();
    Ok(TripSummary { payment_count: members.len() as u32, total_amount, bad_debt_amount, trip })
}

/// [`summary`] for every trip of `owner`.
pub async fn all_summaries(store: &dyn Store, owner: Uuid) -> Result<Vec<TripSummary>, CoreError> {
    let trips = store.list_trips(owner).await?;
    let payments = store.list_payments(owner).await?;
    let mut summaries = Vec::with_capacity(trips.len());
    for trip in trips {
        let members: Vec<&Payment> = payments.iter().filter(|p| p.trip_id == Some(trip.id)).collect();
        let total_amount = members.iter().map(|p| p.amount).sum();
        let bad_debt_amount = members.iter().filter(|p| p.bad_debt).map(|p| p.amount).sum();
        summaries.push(TripSummary { payment_count: members.len() as u32, total_amount, bad_debt_amount, trip });
    }
    Ok(summaries)
}

/// Recompute `trip_id`/`trip_assignment_state` for one payment against the
/// owner's current trips. A no-op for drafts and for `manual`/`blocked`
/// sources, which are never recomputed automatically.
pub async fn recompute_payment_assignment(
    store: &dyn Store,
    mut payment: Payment,
) -> Result<Payment, CoreError> {
    if payment.is_draft || payment.trip_assignment_source != TripAssignmentSource::Auto {
        return Ok(payment);
    }
    let Some(ts) = payment.transaction_time_ts else {
        payment.trip_id = None;
        payment.trip_assignment_state = TripAssignmentState::NoMatch;
        store.put_payment(payment.clone()).await?;
        return Ok(payment);
    };

    let trips = store.list_trips(payment.owner).await?;
    let matches: Vec<&Trip> = trips.iter().filter(|t| t.contains(ts)).collect();
    match matches.as_slice() {
        [] => {
            payment.trip_id = None;
            payment.trip_assignment_state = TripAssignmentState::NoMatch;
        }
        [only] => {
            payment.trip_id = Some(only.id);
            payment.trip_assignment_state = TripAssignmentState::Assigned;
        }
        _ => {
            payment.trip_id = None;
            payment.trip_assignment_state = TripAssignmentState::Overlap;
        }
    }
    store.put_payment(payment.clone()).await?;
    Ok(payment)
}

/// User picks a trip for a pending payment. Marks the payment `manual` so it
/// is never auto-recomputed away from this choice.
pub async fn assign_pending(
    store: &dyn Store,
    payment_id: Uuid,
    trip_id: Uuid,
) -> Result<Payment, CoreError> {
    let mut payment = get_payment_or_err(store, payment_id).await?;
    let trip = store
        .get_trip(trip_id)
        .await?
        .ok_or_else(|| CoreError::new(CoreErrorKind::NotFound, "trip not found"))?;
    if trip.owner != payment.owner {
        return Err(CoreError::new(CoreErrorKind::NotFound, "trip not found"));
    }
    payment.trip_id = Some(trip_id);
    payment.trip_assignment_source = TripAssignmentSource::Manual;
    payment.trip_assignment_state = TripAssignmentState::Assigned;
    store.put_payment(payment.clone()).await?;
    Ok(payment)
}

/// User explicitly declines to assign a trip. Surfaces in the pending queue
/// as `no_match`/`source=manual` rather than being re-offered by auto-match.
pub async fn unassign_pending(store: &dyn Store, payment_id: Uuid) -> Result<Payment, CoreError> {
    let mut payment = get_payment_or_err(store, payment_id).await?;
    payment.trip_id = None;
    payment.trip_assignment_source = TripAssignmentSource::Manual;
    payment.trip_assignment_state = TripAssignmentState::NoMatch;
    store.put_payment(payment.clone()).await?;
    Ok(payment)
}

/// Block a pending payment from ever being auto-assigned.
pub async fn block_pending(store: &dyn Store, payment_id: Uuid) -> Result<Payment, CoreError> {
    let mut payment = get_payment_or_err(store, payment_id).await?;
    payment.trip_id = None;
    payment.trip_assignment_source = TripAssignmentSource::Blocked;
    payment.trip_assignment_state = TripAssignmentState::Blocked;
    store.put_payment(payment.clone()).await?;
    Ok(payment)
}

async fn get_payment_or_err(store: &dyn Store, id: Uuid) -> Result<Payment, CoreError> {
    store
        .get_payment(id)
        .await?
        .ok_or_else(|| CoreError::new(CoreErrorKind::NotFound, "payment not found"))
}

/// Recompute every `auto`-source, non-draft payment of `owner` whose
/// transaction time falls in the union of `pre_range`/`post_range` (a trip's
/// interval before and after a create/move/delete), per spec: "both pre- and
/// post-change union is evaluated". Returns the set of trip IDs touched, for
/// a post-commit bad-debt rollup.
pub async fn recompute_for_trip_change(
    store: &dyn Store,
    owner: Uuid,
    pre_range: Option<(TimestampMillis, TimestampMillis)>,
    post_range: Option<(TimestampMillis, TimestampMillis)>,
) -> Result<Vec<Uuid>, CoreError> {
    let ranges: Vec<(i64, i64)> = [pre_range, post_range]
        .into_iter()
        .flatten()
        .map(|(start, end)| (start.as_i64(), end.as_i64()))
        .collect();
    if ranges.is_empty() {
        return Ok(Vec::new());
    }

    let payments = store.list_payments(owner).await?;
    let mut affected_trips = std::collections::HashSet::new();
    for payment in payments {
        if payment.is_draft || payment.trip_assignment_source != TripAssignmentSource::Auto {
            continue;
        }
        let Some(ts) = payment.transaction_time_ts else { continue };
        let in_range = ranges.iter().any(|(start, end)| *start <= ts.as_i64() && ts.as_i64() < *end);
        if !in_range {
            continue;
        }
        let before_trip = payment.trip_id;
        let after = recompute_payment_assignment(store, payment).await?;
        if let Some(id) = before_trip {
            affected_trips.insert(id);
        }
        if let Some(id) = after.trip_id {
            affected_trips.insert(id);
        }
    }
    Ok(affected_trips.into_iter().collect())
}

/// A trip is locked once every non-draft payment assigned to it is either
/// not bad-debt, or is linked to a non-draft invoice that is itself not
/// bad-debt. An empty (no non-draft payments) trip is never locked.
pub async fn is_trip_locked(store: &dyn Store, trip_id: Uuid) -> Result<bool, CoreError> {
    let Some(trip) = store.get_trip(trip_id).await? else {
        return Ok(false);
    };
    let payments: Vec<Payment> = store
        .list_payments(trip.owner)
        .await?
        .into_iter()
        .filter(|p| !p.is_draft && p.trip_id == Some(trip_id))
        .collect();
    if payments.is_empty() {
        return Ok(false);
    }

    for payment in &payments {
        if !payment.bad_debt {
            continue;
        }
        let mut has_clean_invoice = false;
        for link in store.links_for_payment(payment.id).await? {
            if let Some(invoice) = store.get_invoice(link.invoice_id).await? {
                if !invoice.is_draft && !invoice.bad_debt {
                    has_clean_invoice = true;
                    break;
                }
            }
        }
        if !has_clean_invoice {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Guard for destructive trip operations (delete-with-cascade, a time-change
/// that would evict a payment, reimbursement-status flips, ...).
pub async fn enforce_not_locked(store: &dyn Store, trip_id: Uuid) -> Result<(), CoreError> {
    if is_trip_locked(store, trip_id).await? {
        return Err(CoreError::new(
            CoreErrorKind::TripBadDebtLocked,
            "trip is bad-debt locked; destructive operation rejected",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{DedupStatus, InvoiceSource, ParseStatus};
    use crate::store::memory::MemoryStore;

    fn trip(owner: Uuid, start_ms: i64, end_ms: i64) -> Trip {
        Trip {
            id: Uuid::new_v4(),
            owner,
            name: "Trip".to_string(),
            start_time: "2025-10-01T00:00:00Z".to_string(),
            end_time: "2025-10-05T00:00:00Z".to_string(),
            start_time_ts: TimestampMillis::from_millis_checked(start_ms).unwrap(),
            end_time_ts: TimestampMillis::from_millis_checked(end_ms).unwrap(),
            timezone: "UTC".to_string(),
            reimburse_status: crate::model::ReimburseStatus::Unreimbursed,
            note: None,
        }
    }

    fn payment(owner: Uuid, ts_ms: i64) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            owner,
            is_draft: false,
            amount: 10.0,
            merchant: None,
            category: None,
            payment_method: None,
            description: None,
            transaction_time: None,
            transaction_time_ts: Some(TimestampMillis::from_millis_checked(ts_ms).unwrap()),
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

    fn invoice(owner: Uuid, bad_debt: bool) -> crate::model::Invoice {
        crate::model::Invoice {
            id: Uuid::new_v4(),
            owner,
            is_draft: false,
            payment_id: None,
            filename: "f.pdf".to_string(),
            original_name: "f.pdf".to_string(),
            file_path: "owner/f.pdf".to_string(),
            file_size: 10,
            file_sha256: None,
            invoice_number: None,
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
            bad_debt,
            created_at: TimestampMillis::now(),
        }
    }

    #[tokio::test]
    async fn single_overlap_assigns_exactly_one_trip() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let t1 = trip(owner, 1_000, 10_000);
        store.put_trip(t1.clone()).await.unwrap();

        let p = payment(owner, 5_000);
        let updated = recompute_payment_assignment(&store, p).await.unwrap();
        assert_eq!(updated.trip_id, Some(t1.id));
        assert_eq!(updated.trip_assignment_state, TripAssignmentState::Assigned);
    }

    #[tokio::test]
    async fn two_overlapping_trips_yield_overlap_state() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        store.put_trip(trip(owner, 1_000, 10_000)).await.unwrap();
        store.put_trip(trip(owner, 8_000, 20_000)).await.unwrap();

        let p = payment(owner, 9_000);
        let updated = recompute_payment_assignment(&store, p).await.unwrap();
        assert_eq!(updated.trip_id, None);
        assert_eq!(updated.trip_assignment_state, TripAssignmentState::Overlap);
    }

    #[tokio::test]
    async fn no_trip_yields_no_match() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let p = payment(owner, 500);
        let updated = recompute_payment_assignment(&store, p).await.unwrap();
        assert_eq!(updated.trip_assignment_state, TripAssignmentState::NoMatch);
    }

    #[tokio::test]
    async fn manual_source_is_never_recomputed() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let t1 = trip(owner, 1_000, 10_000);
        store.put_trip(t1).await.unwrap();

        let mut p = payment(owner, 5_000);
        p.trip_assignment_source = TripAssignmentSource::Manual;
        p.trip_assignment_state = TripAssignmentState::NoMatch;
        let untouched = recompute_payment_assignment(&store, p.clone()).await.unwrap();
        assert_eq!(untouched.trip_assignment_state, TripAssignmentState::NoMatch);
        assert_eq!(untouched.trip_id, None);
    }

    #[tokio::test]
    async fn trip_with_no_nondraft_payments_is_not_locked() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let t1 = trip(owner, 1_000, 10_000);
        store.put_trip(t1.clone()).await.unwrap();
        assert!(!is_trip_locked(&store, t1.id).await.unwrap());
    }

    #[tokio::test]
    async fn bad_debt_payment_without_clean_invoice_blocks_lock() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let t1 = trip(owner, 1_000, 10_000);
        store.put_trip(t1.clone()).await.unwrap();

        let mut p = payment(owner, 5_000);
        p.trip_id = Some(t1.id);
        p.bad_debt = true;
        store.put_payment(p).await.unwrap();

        assert!(!is_trip_locked(&store, t1.id).await.unwrap());
    }

    #[tokio::test]
    async fn bad_debt_payment_with_clean_invoice_is_locked() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let t1 = trip(owner, 1_000, 10_000);
        store.put_trip(t1.clone()).await.unwrap();

        let mut p = payment(owner, 5_000);
        p.trip_id = Some(t1.id);
        p.bad_debt = true;
        let payment_id = p.id;
        store.put_payment(p).await.unwrap();

        let inv = invoice(owner, false);
        let invoice_id = inv.id;
        store.put_invoice(inv).await.unwrap();
        store
            .link_invoice_payment(crate::model::InvoicePaymentLink { invoice_id, payment_id })
            .await
            .unwrap();

        assert!(is_trip_locked(&store, t1.id).await.unwrap());
        assert!(enforce_not_locked(&store, t1.id).await.is_err());
    }
}
