//! Orchestrates the nine-step invoice parse pipeline: fetch the message body,
//! extract MIME artifacts, resolve links to direct downloads, prefer
//! XML-first parsing with a PDF-OCR fallback, and persist the result.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use uuid::Uuid;

use sbm_common::error::{CoreError, CoreErrorKind};
use sbm_common::hex;
use sbm_common::sha256;
use sbm_common::time::TimestampMillis;

use crate::http_fetcher::{HttpFetcher, UserAgentMode};
use crate::invoice::text::parse_invoice_text;
use crate::invoice::xml::parse_invoice_xml;
use crate::link_scorer::{
    best_invoice_preview_url_from_body, best_preview_url_from_text, is_bad_email_preview_url,
    is_direct_pdf_url, is_direct_xml_url,
};
use crate::mime_extractor::{self, ExtractedArtifacts};
use crate::model::{EmailLog, EmailLogStatus, Invoice, InvoiceAttachment, InvoiceSource, ParseStatus};
use crate::ocr::OcrEngine;
use crate::ocr_cache::OcrCache;
use crate::path;
use crate::providers::{baiwang, generic, nuonuo, ResolvedUrls};
use crate::store::Store;
use crate::strsim::longest_common_substring_len;

const PDF_FETCH_CAP: usize = 20 * 1024 * 1024;
const XML_BYTE_CAP: usize = 5 * 1024 * 1024;

/// Everything the pipeline needs to do its work; a thin façade over the
/// collaborators so `parse_log` itself stays readable.
pub struct PipelineContext<'a> {
    pub store: &'a dyn Store,
    pub fetcher: &'a HttpFetcher,
    pub ocr: &'a dyn OcrEngine,
    pub ocr_cache: &'a OcrCache,
    pub uploads_dir: &'a str,
}

/// Step 1-9 of the invoice parse pipeline for one already-fetched message.
///
/// `raw_message` is the RFC 5322 bytes fetched via `BODY.PEEK[]`; callers in
/// the IMAP manager are responsible for that fetch and for the ownership
/// check in step 1.
pub async fn parse_log(
    ctx: &PipelineContext<'_>,
    mut log: EmailLog,
    raw_message: &[u8],
) -> Result<EmailLog, CoreError> {
    // Step 1 (short-circuit) is the caller's responsibility; by the time we
    // get here the caller has decided a (re)parse is needed.
    log.status = EmailLogStatus::Parsing;
    ctx.store.put_email_log(log.clone()).await?;

    // Step 3: extract MIME artifacts and candidate URLs.
    let artifacts = mime_extractor::extract(raw_message);
    let mut candidates = gather_url_candidates(&artifacts, &log);

    let mut resolved = ResolvedUrls {
        pdf_url: log.invoice_pdf_url.clone(),
        xml_url: log.invoice_xml_url.clone(),
    };
    let mut last_resolver_error: Option<String> = None;

    let have_pdf_bytes = artifacts.primary_pdf_bytes.is_some();
    if !have_pdf_bytes || !resolved.pdf_url.as_deref().is_some_and(is_direct_pdf_url) {
        // Step 4: ordered candidate resolution.
        candidates.retain(|u| !is_bad_email_preview_url(u));
        for candidate in &candidates {
            if resolved.is_complete() {
                break;
            }
            match resolve_one(ctx.fetcher, candidate).await {
                Ok(r) => resolved.merge(r),
                Err(e) => last_resolver_error = Some(e.to_string()),
            }
        }
    }

    if resolved.pdf_url.is_some() {
        log.invoice_pdf_url.get_or_insert_with(|| resolved.pdf_url.clone().unwrap());
    }
    if resolved.xml_url.is_some() {
        log.invoice_xml_url.get_or_insert_with(|| resolved.xml_url.clone().unwrap());
    }

    // Step 5/6: obtain PDF bytes, either already extracted or by fetching
    // the resolved direct URL.
    let pdf_bytes = match &artifacts.primary_pdf_bytes {
        Some(bytes) => Some(bytes.clone()),
        None => match &resolved.pdf_url {
            Some(url) if is_direct_pdf_url(url) => {
                match ctx.fetcher.get(url, UserAgentMode::Service, PDF_FETCH_CAP).await {
                    Ok(resp) => Some(resp.body),
                    Err(e) => {
                        last_resolver_error = Some(e.to_string());
                        None
                    }
                }
            }
            _ => None,
        },
    };

    if pdf_bytes.is_none() && !resolved.pdf_url.as_deref().is_some_and(is_direct_pdf_url) {
        log.status = EmailLogStatus::Error;
        log.parse_error = Some(
            last_resolver_error.unwrap_or_else(|| "no invoice PDF could be resolved".to_string()),
        );
        ctx.store.put_email_log(log.clone()).await?;
        return Ok(log);
    }

    // Step 7: invoice creation, XML-first with PDF-OCR fallback.
    let owner = log.owner;
    let primary_name = artifacts
        .primary_pdf_filename
        .clone()
        .unwrap_or_else(|| "invoice.pdf".to_string());

    let xml_bytes = match &artifacts.xml_bytes {
        Some(bytes) => Some(bytes.clone()),
        None => match &resolved.xml_url {
            Some(url) => ctx
                .fetcher
                .get(url, UserAgentMode::Service, PDF_FETCH_CAP)
                .await
                .ok()
                .map(|r| r.body),
            None => None,
        },
    };

    let invoice = build_invoice(
        ctx,
        owner,
        &primary_name,
        pdf_bytes.as_deref(),
        xml_bytes.as_deref(),
        InvoiceSource::Email,
    )
    .await?;

    ctx.store.put_invoice(invoice.clone()).await?;

    // Step 8: extra PDFs become standalone invoices (air/rail itinerary or
    // generic name) or are attached to the best-matched invoice by
    // longest-common-substring name match (ride-hailing trip tables), with
    // each target invoice taking at most one itinerary attachment.
    let mut parsed_ids = vec![invoice.id];
    let mut standalone_invoices = vec![invoice.clone()];
    let mut attached_targets: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
    for (name, bytes) in &artifacts.extra_pdfs {
        if mime_extractor::is_ride_hailing_itinerary(name) {
            let Some(target) = standalone_invoices
                .iter()
                .filter(|inv| !attached_targets.contains(&inv.id))
                .max_by_key(|inv| longest_common_substring_len(&inv.filename, name))
            else {
                continue;
            };
            let target_id = target.id;
            let attachment = match store_attachment_bytes(ctx, owner, name, bytes, target_id).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(name, error = %e, "failed to store itinerary attachment");
                    continue;
                }
            };
            if let Err(e) = ctx.store.put_invoice_attachment(attachment).await {
                warn!(name, error = %e, "failed to persist itinerary attachment");
                continue;
            }
            attached_targets.insert(target_id);
            continue;
        }

        match build_invoice(ctx, owner, name, Some(bytes), None, InvoiceSource::Email).await {
            Ok(extra) => {
                ctx.store.put_invoice(extra.clone()).await?;
                parsed_ids.push(extra.id);
                standalone_invoices.push(extra);
            }
            Err(e) => warn!(name, error = %e, "failed to create invoice for extra pdf"),
        }
    }

    // Step 9: success.
    log.status = EmailLogStatus::Parsed;
    log.parsed_invoice_id = Some(invoice.id);
    if parsed_ids.len() > 1 {
        log.parsed_invoice_ids = parsed_ids;
    }
    log.parse_error = None;
    ctx.store.put_email_log(log.clone()).await?;
    info!(log_id = %log.id, invoice_id = %invoice.id, "parsed email log");
    Ok(log)
}

fn gather_url_candidates(artifacts: &ExtractedArtifacts, log: &EmailLog) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(url) = best_invoice_preview_url_from_body(&artifacts.body_text) {
        candidates.push(url);
    }
    if let Some(url) = best_preview_url_from_text(&artifacts.body_text) {
        candidates.push(url);
    }
    if let Some(url) = &log.invoice_pdf_url {
        candidates.push(url.clone());
    }
    if let Some(url) = &log.invoice_xml_url {
        candidates.push(url.clone());
    }
    candidates.dedup();
    candidates
}

/// Resolve one candidate URL: accept directly if it already satisfies a
/// predicate, else try the provider resolvers, else fall back to scraping.
async fn resolve_one(fetcher: &HttpFetcher, url: &str) -> Result<ResolvedUrls, CoreError> {
    if is_direct_pdf_url(url) || is_direct_xml_url(url) {
        return Ok(ResolvedUrls {
            pdf_url: is_direct_pdf_url(url).then(|| url.to_string()),
            xml_url: is_direct_xml_url(url).then(|| url.to_string()),
        });
    }
    if baiwang::is_short_link(url) || baiwang::is_preview_link(url) {
        return baiwang::resolve(fetcher, url).await;
    }
    if nuonuo::is_short_link(url) {
        return nuonuo::resolve_short_link(fetcher, url).await;
    }
    if nuonuo::is_portal_link(url) {
        return nuonuo::resolve_portal_link(fetcher, url).await;
    }
    generic::resolve(fetcher, url).await
}

/// Write an itinerary attachment's bytes to the object store and build the
/// [`InvoiceAttachment`] row, mirroring `build_invoice`'s file-write step.
async fn store_attachment_bytes(
    ctx: &PipelineContext<'_>,
    owner: Uuid,
    filename: &str,
    bytes: &[u8],
    invoice_id: Uuid,
) -> Result<InvoiceAttachment, CoreError> {
    let ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let stored = path::new_storage_path(owner, ns, filename);
    let digest = hex::encode(sha256::digest(bytes).as_ref());
    let abs_path = path::resolve(ctx.uploads_dir, &stored);
    if let Some(parent) = abs_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::new(CoreErrorKind::ParseError, format!("failed to create uploads dir: {e}")))?;
    }
    tokio::fs::write(&abs_path, bytes)
        .await
        .map_err(|e| CoreError::new(CoreErrorKind::ParseError, format!("failed to write attachment file: {e}")))?;

    Ok(InvoiceAttachment {
        id: Uuid::new_v4(),
        invoice_id,
        kind: "itinerary".to_string(),
        filename: filename.to_string(),
        original_name: filename.to_string(),
        file_path: stored,
        file_size: Some(bytes.len() as u64),
        file_sha256: Some(digest),
        source: InvoiceSource::Email,
    })
}

/// Re-run field extraction over an invoice's already-stored file (XML or
/// zip-wrapped XML parsed directly, anything else falling back to PDF-OCR),
/// replacing the extracted fields in place. `is_draft`/`dedup_status` are
/// untouched — reparse is a field-extraction retry, not a confirm.
pub async fn reparse_invoice(ctx: &PipelineContext<'_>, mut invoice: Invoice) -> Result<Invoice, CoreError> {
    let abs_path = path::resolve(ctx.uploads_dir, &invoice.file_path);
    let bytes = tokio::fs::read(&abs_path)
        .await
        .map_err(|e| CoreError::new(CoreErrorKind::ParseError, format!("failed to read invoice file: {e}")))?;

    let xml_for_parse: Option<Vec<u8>> = if bytes.starts_with(b"<?xml") || bytes.starts_with(b"<") {
        Some(bytes.clone())
    } else if bytes.starts_with(b"PK") {
        crate::zip_xml::normalize_invoice_xml_bytes(&bytes, XML_BYTE_CAP)
    } else {
        None
    };

    let (parsed, raw_text) = if let Some(xml) = xml_for_parse {
        (Some(parse_invoice_xml(&xml)), None)
    } else {
        let cache_key = OcrCache::key_for(&bytes);
        let text = match ctx.ocr_cache.get(&cache_key).await {
            Some(cached) => cached,
            None => {
                let result = ctx.ocr.extract_text_from_pdf(&bytes).await?;
                ctx.ocr_cache.put(cache_key, result.raw_text.clone()).await;
                result.raw_text
            }
        };
        (Some(parse_invoice_text(&text)), Some(text))
    };

    invoice.invoice_number = parsed.as_ref().and_then(|p| p.invoice_number.clone());
    invoice.invoice_date = parsed.as_ref().and_then(|p| p.issue_date.clone());
    invoice.amount = parsed.as_ref().and_then(|p| p.total_amount);
    invoice.tax_amount = parsed.as_ref().and_then(|p| p.tax_amount);
    invoice.seller_name = parsed.as_ref().and_then(|p| p.seller_name.clone());
    invoice.buyer_name = parsed.as_ref().and_then(|p| p.buyer_name.clone());
    invoice.extracted_data =
        parsed.map(|p| serde_json::to_value(&p).unwrap_or(serde_json::Value::Null)).unwrap_or(serde_json::Value::Null);
    invoice.parse_status = ParseStatus::Success;
    invoice.parse_error = None;
    invoice.raw_text = raw_text;

    ctx.store.put_invoice(invoice.clone()).await?;
    Ok(invoice)
}

async fn build_invoice(
    ctx: &PipelineContext<'_>,
    owner: Uuid,
    filename: &str,
    pdf_bytes: Option<&[u8]>,
    xml_bytes: Option<&[u8]>,
    source: InvoiceSource,
) -> Result<Invoice, CoreError> {
    let (parsed, raw_text, parse_status, parse_error) = if let Some(xml) = xml_bytes {
        let parsed = parse_invoice_xml(xml);
        (Some(parsed), None, ParseStatus::Success, None)
    } else if let Some(pdf) = pdf_bytes {
        let cache_key = OcrCache::key_for(pdf);
        let text = match ctx.ocr_cache.get(&cache_key).await {
            Some(cached) => cached,
            None => match ctx.ocr.extract_text_from_pdf(pdf).await {
                Ok(result) => {
                    ctx.ocr_cache.put(cache_key, result.raw_text.clone()).await;
                    result.raw_text
                }
                Err(e) => {
                    return Err(e);
                }
            },
        };
        let parsed = parse_invoice_text(&text);
        (Some(parsed), Some(text), ParseStatus::Success, None)
    } else {
        (None, None, ParseStatus::Failed, Some("no invoice artifacts available".to_string()))
    };

    let (file_path, file_size, file_sha256) = if let Some(data) = pdf_bytes.or(xml_bytes) {
        let ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let stored = path::new_storage_path(owner, ns, filename);
        let digest = hex::encode(sha256::digest(data).as_ref());
        let abs_path = path::resolve(ctx.uploads_dir, &stored);
        if let Some(parent) = abs_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::new(CoreErrorKind::ParseError, format!("failed to create uploads dir: {e}")))?;
        }
        tokio::fs::write(&abs_path, data)
            .await
            .map_err(|e| CoreError::new(CoreErrorKind::ParseError, format!("failed to write invoice file: {e}")))?;
        (stored, data.len() as u64, Some(digest))
    } else {
        (String::new(), 0u64, None)
    };

    let now = TimestampMillis::now();
    Ok(Invoice {
        id: Uuid::new_v4(),
        owner,
        is_draft: true,
        payment_id: None,
        filename: filename.to_string(),
        original_name: filename.to_string(),
        file_path,
        file_size,
        file_sha256,
        invoice_number: parsed.as_ref().and_then(|p| p.invoice_number.clone()),
        invoice_date: parsed.as_ref().and_then(|p| p.issue_date.clone()),
        amount: parsed.as_ref().and_then(|p| p.total_amount),
        tax_amount: parsed.as_ref().and_then(|p| p.tax_amount),
        seller_name: parsed.as_ref().and_then(|p| p.seller_name.clone()),
        buyer_name: parsed.as_ref().and_then(|p| p.buyer_name.clone()),
        extracted_data: parsed
            .map(|p| serde_json::to_value(&p).unwrap_or(serde_json::Value::Null))
            .unwrap_or(serde_json::Value::Null),
        parse_status,
        parse_error,
        raw_text,
        source,
        dedup_status: crate::model::DedupStatus::Ok,
        dedup_ref_id: None,
        bad_debt: false,
        created_at: now,
    })
}
