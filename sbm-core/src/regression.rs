//! Regression sample capture, export, and repo-fixture import.
//!
//! A sample freezes one parse's raw input and its (at-the-time) expected
//! structured output so later changes to the parsers can be replayed against
//! it. `(kind, raw_hash)` is the sample's identity; `origin=repo` always wins
//! a collision against a UI-captured sample, per the dedup rule in the
//! entity's invariant.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sbm_common::error::CoreError;
use sbm_common::hex;
use sbm_common::sha256;

use crate::model::{Invoice, Payment, RegressionKind, RegressionOrigin, RegressionSample};
use crate::store::Store;

pub async fn create_from_payment(
    store: &dyn Store,
    payment: &Payment,
    name: String,
) -> Result<RegressionSample, CoreError> {
    let raw_text = serde_json::to_string(&payment.extracted_data).unwrap_or_default();
    upsert(
        store,
        RegressionKind::PaymentScreenshot,
        name,
        RegressionOrigin::Ui,
        "payment",
        payment.id,
        raw_text,
        payment.extracted_data.clone(),
    )
    .await
}

pub async fn create_from_invoice(
    store: &dyn Store,
    invoice: &Invoice,
    name: String,
) -> Result<RegressionSample, CoreError> {
    let raw_text = invoice.raw_text.clone().unwrap_or_default();
    upsert(
        store,
        RegressionKind::Invoice,
        name,
        RegressionOrigin::Ui,
        "invoice",
        invoice.id,
        raw_text,
        invoice.extracted_data.clone(),
    )
    .await
}

pub async fn list(store: &dyn Store) -> Result<Vec<RegressionSample>, CoreError> {
    store.list_regression_samples().await
}

pub async fn delete(store: &dyn Store, id: Uuid) -> Result<(), CoreError> {
    store.delete_regression_sample(id).await
}

pub async fn bulk_delete(store: &dyn Store, ids: &[Uuid]) -> Result<(), CoreError> {
    for id in ids {
        store.delete_regression_sample(*id).await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upsert(
    store: &dyn Store,
    kind: RegressionKind,
    name: String,
    origin: RegressionOrigin,
    source_type: &str,
    source_id: Uuid,
    raw_text: String,
    expected_json: serde_json::Value,
) -> Result<RegressionSample, CoreError> {
    let raw_hash = hex::encode(sha256::digest(raw_text.as_bytes()).as_ref());
    let existing = store.find_regression_sample_by_hash(kind, &raw_hash).await?;

    if let Some(existing) = &existing {
        if existing.origin == RegressionOrigin::Repo && origin != RegressionOrigin::Repo {
            return Ok(existing.clone());
        }
    }

    let id = existing.map(|s| s.id).unwrap_or_else(Uuid::new_v4);
    let sample = RegressionSample {
        id,
        kind,
        name,
        origin,
        source_type: source_type.to_string(),
        source_id,
        raw_text,
        raw_hash,
        expected_json,
    };
    store.put_regression_sample(sample.clone()).await?;
    Ok(sample)
}

/// The on-disk shape of one fixture file inside an export/import archive.
/// Lighter than [`RegressionSample`]: `id` and `raw_hash` are derived, not
/// carried, so a fixture can be hand-edited and re-imported.
#[derive(Serialize, Deserialize)]
struct FixtureFile {
    kind: RegressionKind,
    name: String,
    source_type: String,
    source_id: Uuid,
    raw_text: String,
    expected_json: serde_json::Value,
}

/// Bundle every sample into a ZIP of one JSON file per sample, named
/// `<kind>/<id>.json`.
pub fn export_zip(samples: &[RegressionSample]) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut buf);
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for sample in samples {
            let fixture = FixtureFile {
                kind: sample.kind,
                name: sample.name.clone(),
                source_type: sample.source_type.clone(),
                source_id: sample.source_id,
                raw_text: sample.raw_text.clone(),
                expected_json: sample.expected_json.clone(),
            };
            let kind_dir = match sample.kind {
                RegressionKind::PaymentScreenshot => "payment_screenshot",
                RegressionKind::Invoice => "invoice",
            };
            let json = serde_json::to_vec_pretty(&fixture)
                .map_err(|e| CoreError::parse_error(format!("failed to serialize fixture: {e}")))?;
            writer
                .start_file(format!("{kind_dir}/{}.json", sample.id), options)
                .map_err(|e| CoreError::parse_error(format!("zip write failed: {e}")))?;
            writer
                .write_all(&json)
                .map_err(|e| CoreError::parse_error(format!("zip write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| CoreError::parse_error(format!("zip finish failed: {e}")))?;
    }
    Ok(buf)
}

/// Import every `.json` fixture in `zip_bytes` as an `origin=repo` sample;
/// repo samples always win a `(kind, raw_hash)` collision. Returns the
/// number of fixtures imported.
pub async fn import_repo_samples(store: &dyn Store, zip_bytes: &[u8]) -> Result<u32, CoreError> {
    let reader = std::io::Cursor::new(zip_bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| CoreError::parse_error(format!("not a valid zip archive: {e}")))?;

    let mut imported = 0u32;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| CoreError::parse_error(format!("zip read failed: {e}")))?;
        if !entry.name().to_ascii_lowercase().ends_with(".json") {
            continue;
        }
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| CoreError::parse_error(format!("zip read failed: {e}")))?;
        drop(entry);

        let fixture: FixtureFile = serde_json::from_slice(&buf)
            .map_err(|e| CoreError::parse_error(format!("invalid fixture json: {e}")))?;
        upsert(
            store,
            fixture.kind,
            fixture.name,
            RegressionOrigin::Repo,
            &fixture.source_type,
            fixture.source_id,
            fixture.raw_text,
            fixture.expected_json,
        )
        .await?;
        imported += 1;
    }
    Ok(imported)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{DedupStatus, InvoiceSource, ParseStatus, TripAssignmentSource, TripAssignmentState};
    use crate::store::memory::MemoryStore;
    use sbm_common::time::TimestampMillis;

    fn sample_invoice(owner: Uuid) -> Invoice {
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
            invoice_number: Some("INV-1".to_string()),
            invoice_date: None,
            amount: Some(10.0),
            tax_amount: None,
            seller_name: None,
            buyer_name: None,
            extracted_data: serde_json::json!({"invoice_number": "INV-1"}),
            parse_status: ParseStatus::Success,
            parse_error: None,
            raw_text: Some("<xml>raw</xml>".to_string()),
            source: InvoiceSource::Upload,
            dedup_status: DedupStatus::Ok,
            dedup_ref_id: None,
            bad_debt: false,
            created_at: TimestampMillis::now(),
        }
    }

    fn sample_payment(owner: Uuid) -> Payment {
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
            transaction_time_ts: None,
            screenshot_path: None,
            file_sha256: None,
            extracted_data: serde_json::json!({"amount": 10.0}),
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
    async fn repo_origin_wins_collision_over_ui() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let invoice = sample_invoice(owner);

        let ui_sample = create_from_invoice(&store, &invoice, "ui-capture".to_string()).await.unwrap();
        assert_eq!(ui_sample.origin, RegressionOrigin::Ui);

        let zip = export_zip(&[RegressionSample {
            name: "repo-fixture".to_string(),
            origin: RegressionOrigin::Repo,
            ..ui_sample.clone()
        }])
        .unwrap();
        let imported = import_repo_samples(&store, &zip).await.unwrap();
        assert_eq!(imported, 1);

        let all = list(&store).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].origin, RegressionOrigin::Repo);
        assert_eq!(all[0].name, "repo-fixture");

        // A later UI capture of the same raw text must not clobber it.
        let reattempt = create_from_invoice(&store, &invoice, "ui-again".to_string()).await.unwrap();
        assert_eq!(reattempt.origin, RegressionOrigin::Repo);
        assert_eq!(reattempt.name, "repo-fixture");
    }

    #[tokio::test]
    async fn export_then_import_round_trips_samples() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let payment = sample_payment(owner);
        create_from_payment(&store, &payment, "screenshot-1".to_string()).await.unwrap();

        let samples = list(&store).await.unwrap();
        let zip = export_zip(&samples).unwrap();

        let store2 = MemoryStore::new();
        let imported = import_repo_samples(&store2, &zip).await.unwrap();
        assert_eq!(imported, 1);
        let roundtripped = list(&store2).await.unwrap();
        assert_eq!(roundtripped.len(), 1);
        assert_eq!(roundtripped[0].kind, RegressionKind::PaymentScreenshot);
        assert_eq!(roundtripped[0].origin, RegressionOrigin::Repo);
    }

    #[tokio::test]
    async fn bulk_delete_removes_all_listed() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let a = create_from_payment(&store, &sample_payment(owner), "a".to_string()).await.unwrap();
        let b = create_from_invoice(&store, &sample_invoice(owner), "b".to_string()).await.unwrap();

        bulk_delete(&store, &[a.id, b.id]).await.unwrap();
        assert!(list(&store).await.unwrap().is_empty());
    }
}
