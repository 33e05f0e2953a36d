//! The invoice <-> payment weighted-score matcher used by `suggest_payments`
//! and `suggest_invoices`.

use uuid::Uuid;

use sbm_common::error::CoreError;

use crate::model::{Invoice, InvoicePaymentLink, Payment};
use crate::store::Store;
use crate::strsim::longest_common_substring_len;

const MIN_CANDIDATE_POOL: usize = 200;
const CANDIDATE_MULTIPLIER: usize = 50;

const WEIGHT_AMOUNT: f64 = 0.55;
const WEIGHT_DATE: f64 = 0.25;
const WEIGHT_MERCHANT: f64 = 0.20;

#[derive(Debug, Clone)]
pub struct Suggestion<T> {
    pub candidate: T,
    pub score: f64,
}

/// Suggest unlinked payments for `invoice`, best match first.
pub async fn suggest_payments(
    store: &dyn Store,
    invoice: &Invoice,
    limit: usize,
) -> Result<Vec<Suggestion<Payment>>, CoreError> {
    let pool_size = (CANDIDATE_MULTIPLIER * limit.max(1)).max(MIN_CANDIDATE_POOL);
    let linked = linked_payment_ids(store, invoice.id).await?;

    let mut candidates = store.list_payments(invoice.owner).await?;
    candidates.truncate(pool_size);
    candidates.retain(|p| !linked.contains(&p.id) && !p.is_draft);

    let invoice_day_ms = invoice.invoice_date.as_deref().and_then(invoice_day_millis);
    let mut scored: Vec<Suggestion<Payment>> = candidates
        .into_iter()
        .map(|payment| {
            let score = score_pair(
                invoice.amount,
                Some(payment.amount),
                invoice_day_ms,
                payment.transaction_time_ts.map(|ts| ts.as_i64()),
                invoice.seller_name.as_deref(),
                payment.merchant.as_deref(),
            );
            Suggestion { candidate: payment, score }
        })
        .collect();

    sort_and_threshold(&mut scored, limit, invoice.amount.is_none(), |p| p.created_at.as_i64());
    Ok(scored)
}

/// Suggest unlinked invoices for `payment`, best match first.
pub async fn suggest_invoices(
    store: &dyn Store,
    payment: &Payment,
    limit: usize,
) -> Result<Vec<Suggestion<Invoice>>, CoreError> {
    let pool_size = (CANDIDATE_MULTIPLIER * limit.max(1)).max(MIN_CANDIDATE_POOL);
    let linked = linked_invoice_ids(store, payment.id).await?;

    let mut candidates = store.list_invoices(payment.owner).await?;
    candidates.truncate(pool_size);
    candidates.retain(|i| !linked.contains(&i.id) && !i.is_draft);

    let payment_ts = payment.transaction_time_ts.map(|ts| ts.as_i64());
    let mut scored: Vec<Suggestion<Invoice>> = candidates
        .into_iter()
        .map(|invoice| {
            let invoice_day_ms = invoice.invoice_date.as_deref().and_then(invoice_day_millis);
            let score = score_pair(
                Some(payment.amount),
                invoice.amount,
                payment_ts,
                invoice_day_ms,
                payment.merchant.as_deref(),
                invoice.seller_name.as_deref(),
            );
            Suggestion { candidate: invoice, score }
        })
        .collect();

    sort_and_threshold(&mut scored, limit, payment_ts.is_none(), |i| i.created_at.as_i64());
    Ok(scored)
}

async fn linked_payment_ids(store: &dyn Store, invoice_id: Uuid) -> Result<Vec<Uuid>, CoreError> {
    Ok(store
        .links_for_invoice(invoice_id)
        .await?
        .into_iter()
        .map(|l: InvoicePaymentLink| l.payment_id)
        .collect())
}

async fn linked_invoice_ids(store: &dyn Store, payment_id: Uuid) -> Result<Vec<Uuid>, CoreError> {
    Ok(store
        .links_for_payment(payment_id)
        .await?
        .into_iter()
        .map(|l: InvoicePaymentLink| l.invoice_id)
        .collect())
}

#[allow(clippy::too_many_arguments)]
fn score_pair(
    amount_a: Option<f64>,
    amount_b: Option<f64>,
    ts_a: Option<i64>,
    ts_b: Option<i64>,
    merchant_a: Option<&str>,
    merchant_b: Option<&str>,
) -> f64 {
    let a = score_amount(amount_a, amount_b);
    let d = score_date(ts_a, ts_b);
    let m = score_merchant(merchant_a, merchant_b);
    WEIGHT_AMOUNT * a + WEIGHT_DATE * d + WEIGHT_MERCHANT * m
}

/// Sort by `(score desc, recency desc)`, then drop anything under the
/// threshold; if that empties the list, fall back to the raw-scored top
/// `limit` candidates so the UI always has something to show.
fn sort_and_threshold<T>(
    scored: &mut Vec<Suggestion<T>>,
    limit: usize,
    reference_has_no_amount: bool,
    recency_key: impl Fn(&T) -> i64,
) {
    scored.sort_by(|x, y| {
        y.score
            .partial_cmp(&x.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| recency_key(&y.candidate).cmp(&recency_key(&x.candidate)))
    });

    let threshold = if reference_has_no_amount { 0.05 } else { 0.15 };
    let above_threshold = scored.iter().filter(|s| s.score >= threshold).count();
    if above_threshold > 0 {
        scored.retain(|s| s.score >= threshold);
    }
    // else: threshold pruned everything; fall through and return the
    // already-sorted raw-scored candidates so the UI has something to show.
    scored.truncate(limit);
}

fn score_amount(a: Option<f64>, b: Option<f64>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else { return 0.0 };
    let diff = (a - b).abs();
    if diff <= 0.01 {
        return 1.0;
    }
    let denom = a.abs().max(b.abs()).max(f64::EPSILON);
    let rel = diff / denom;
    (1.0 - rel * 10.0).max(0.0)
}

fn score_date(a: Option<i64>, b: Option<i64>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else { return 0.0 };
    let days = ((a - b).abs() as f64) / 86_400_000.0;
    if days <= 0.0 {
        1.0
    } else if days >= 30.0 {
        0.0
    } else {
        1.0 - days / 30.0
    }
}

fn score_merchant(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else { return 0.0 };
    let a = normalize_merchant(a);
    let b = normalize_merchant(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shorter = a.chars().count().min(b.chars().count()) as f64;
    let lcs = longest_common_substring_len(&a, &b) as f64;
    (lcs / shorter).min(1.0)
}

fn normalize_merchant(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse `YYYY-MM-DD` into UTC midnight epoch millis via a civil-calendar
/// day count (Howard Hinnant's `days_from_civil`), avoiding a dependency on
/// `time`'s macro-gated format-description parsing.
fn invoice_day_millis(date: &str) -> Option<i64> {
    let mut parts = date.splitn(3, '-');
    let y: i64 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let d: u32 = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return None;
    }
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days_since_epoch = era * 146097 + doe - 719468;
    Some(days_since_epoch * 86_400_000)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn amount_exact_match_scores_one() {
        assert_eq!(score_amount(Some(100.0), Some(100.0)), 1.0);
        assert_eq!(score_amount(Some(100.0), Some(100.005)), 1.0);
    }

    #[test]
    fn amount_within_one_percent_scores_at_least_point_nine() {
        let s = score_amount(Some(1000.0), Some(1005.0));
        assert!(s >= 0.9, "score was {s}");
    }

    #[test]
    fn amount_over_ten_percent_scores_zero() {
        assert_eq!(score_amount(Some(100.0), Some(150.0)), 0.0);
    }

    #[test]
    fn date_same_day_scores_one() {
        let t = invoice_day_millis("2025-10-04").unwrap();
        assert_eq!(score_date(Some(t), Some(t + 1000)), 1.0);
    }

    #[test]
    fn date_beyond_thirty_days_scores_zero() {
        let t = invoice_day_millis("2025-10-04").unwrap();
        let far = t + 31 * 86_400_000;
        assert_eq!(score_date(Some(t), Some(far)), 0.0);
    }

    #[test]
    fn merchant_exact_normalized_match_scores_one() {
        assert_eq!(score_merchant(Some("  Star  Bucks "), Some("starbucks")), 1.0);
    }

    #[test]
    fn merchant_no_overlap_scores_zero() {
        assert_eq!(score_merchant(Some("abc"), Some("xyz")), 0.0);
    }

    #[test]
    fn invoice_day_millis_parses_known_date() {
        // 2025-10-04 is 20,365 days after the epoch.
        assert_eq!(invoice_day_millis("2025-10-04"), Some(20_365 * 86_400_000));
    }

    use crate::model::{DedupStatus, InvoiceSource, ParseStatus, TripAssignmentSource, TripAssignmentState};
    use crate::store::memory::MemoryStore;
    use sbm_common::time::TimestampMillis;

    fn sample_invoice(owner: Uuid, amount: Option<f64>, seller: &str, date: &str) -> Invoice {
        Invoice {
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
            invoice_date: Some(date.to_string()),
            amount,
            tax_amount: None,
            seller_name: Some(seller.to_string()),
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

    fn sample_payment(owner: Uuid, amount: f64, merchant: &str, ts: TimestampMillis) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            owner,
            is_draft: false,
            amount,
            merchant: Some(merchant.to_string()),
            category: None,
            payment_method: None,
            description: None,
            transaction_time: None,
            transaction_time_ts: Some(ts),
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

    #[tokio::test]
    async fn suggest_payments_ranks_closest_match_first() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let invoice_day = invoice_day_millis("2025-10-04").unwrap();

        let good = sample_payment(
            owner,
            100.0,
            "Starbucks",
            TimestampMillis::from_millis_checked(invoice_day).unwrap(),
        );
        let good_id = good.id;
        store.put_payment(good).await.unwrap();

        let bad = sample_payment(
            owner,
            500.0,
            "Unrelated Co",
            TimestampMillis::from_millis_checked(invoice_day + 60 * 86_400_000).unwrap(),
        );
        store.put_payment(bad).await.unwrap();

        let invoice = sample_invoice(owner, Some(100.0), "Starbucks", "2025-10-04");
        let suggestions = suggest_payments(&store, &invoice, 10).await.unwrap();
        assert_eq!(suggestions[0].candidate.id, good_id);
        assert!(suggestions[0].score > 0.9);
    }

    #[tokio::test]
    async fn suggest_invoices_excludes_already_linked() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let ts = TimestampMillis::from_millis_checked(invoice_day_millis("2025-10-04").unwrap()).unwrap();

        let payment = sample_payment(owner, 100.0, "Starbucks", ts);
        store.put_payment(payment.clone()).await.unwrap();

        let invoice = sample_invoice(owner, Some(100.0), "Starbucks", "2025-10-04");
        let invoice_id = invoice.id;
        store.put_invoice(invoice).await.unwrap();
        store
            .link_invoice_payment(InvoicePaymentLink { invoice_id, payment_id: payment.id })
            .await
            .unwrap();

        let suggestions = suggest_invoices(&store, &payment, 10).await.unwrap();
        assert!(suggestions.is_empty());
    }
}
