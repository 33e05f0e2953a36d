//! The external-interface layer: spec.md §6's RPCs surfaced as
//! `#[async_trait]` service traits, each method taking an explicit
//! `owner: Uuid` first parameter (the core's "consumes `owner_user_id` on
//! every call" contract). [`SmartBillManager`] implements every trait by
//! delegating to the engines/stores below it — the same aggregation shape
//! the teacher's `LexeApiClient` uses to implement one `ApiClient` trait
//! over many endpoints.
//!
//! Request/response wire framing, auth, and the HTTP transport itself are
//! out of scope for this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use sbm_common::error::{CoreError, CoreErrorKind};
use sbm_common::shutdown::ShutdownChannel;
use sbm_common::task::CoreTask;
use sbm_common::time::TimestampMillis;

use crate::config::Config;
use crate::http_fetcher::HttpFetcher;
use crate::imap::manager;
use crate::imap::registry::{ConnectionRegistry, SharedRegistry};
use crate::imap::ImapSession;
use crate::invoice::pipeline;
use crate::matcher::{self, Suggestion};
use crate::model::{
    DedupStatus, EmailConfig, EmailLog, Invoice, InvoicePaymentLink, Payment, RegressionSample,
    Task, TaskType, Trip, TripAssignmentState,
};
use crate::ocr::OcrEngine;
use crate::ocr_cache::OcrCache;
use crate::path;
use crate::payment_text::{self, ExtractedPaymentData};
use crate::regression;
use crate::store::Store;
use crate::task_runner::{self, TaskExecutor};
use crate::{draft, trip as trip_assign};

fn not_found() -> CoreError {
    CoreError::new(CoreErrorKind::NotFound, "not found")
}

/// Every owner-scoped lookup goes through this: an entity that exists but
/// belongs to a different owner reads as not-found, not a distinct
/// forbidden error, so the RPC surface never leaks cross-tenant existence.
fn require_owner(owner: Uuid, actual_owner: Uuid) -> Result<(), CoreError> {
    if owner != actual_owner {
        return Err(not_found());
    }
    Ok(())
}

#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create(&self, owner: Uuid, task_type: TaskType, target_id: Uuid, sha: Option<&str>) -> Result<Task, CoreError>;
    async fn get(&self, owner: Uuid, id: Uuid) -> Result<Task, CoreError>;
    async fn cancel(&self, owner: Uuid, id: Uuid) -> Result<bool, CoreError>;
}

#[async_trait]
pub trait EmailService: Send + Sync {
    async fn create_config(&self, config: EmailConfig) -> Result<EmailConfig, CoreError>;
    async fn list_configs(&self, owner: Uuid) -> Result<Vec<EmailConfig>, CoreError>;
    async fn get_config(&self, owner: Uuid, id: Uuid) -> Result<EmailConfig, CoreError>;
    async fn update_config(&self, config: EmailConfig) -> Result<EmailConfig, CoreError>;
    async fn delete_config(&self, owner: Uuid, id: Uuid) -> Result<(), CoreError>;
    async fn logs(&self, owner: Uuid, config_id: Uuid, mailbox: &str) -> Result<Vec<EmailLog>, CoreError>;
    async fn parse_log(&self, owner: Uuid, log: EmailLog, raw_message: &[u8]) -> Result<EmailLog, CoreError>;
    /// Package an already-fetched raw message (the caller does the IMAP
    /// `BODY.PEEK[]`, same division of labor as [`Self::parse_log`]) as a
    /// downloadable `.eml`.
    async fn export_eml(&self, owner: Uuid, log: EmailLog, raw_message: &[u8]) -> Result<(String, Vec<u8>), CoreError>;
}

#[async_trait]
pub trait InvoiceService: Send + Sync {
    async fn upload(&self, invoice: Invoice) -> Result<Invoice, CoreError>;
    async fn list(&self, owner: Uuid) -> Result<Vec<Invoice>, CoreError>;
    async fn get(&self, owner: Uuid, id: Uuid) -> Result<Invoice, CoreError>;
    /// Edit a draft or confirmed invoice. If `invoice.is_draft` transitions
    /// from `true` to `false`, this routes through the §4.7 confirm state
    /// machine; `force_duplicate_save` overrides a suspect (not hash)
    /// duplicate there.
    async fn update(&self, invoice: Invoice, force_duplicate_save: bool) -> Result<Invoice, CoreError>;
    async fn delete(&self, owner: Uuid, id: Uuid) -> Result<(), CoreError>;
    async fn link_payment(&self, owner: Uuid, invoice_id: Uuid, payment_id: Uuid) -> Result<(), CoreError>;
    async fn unlink_payment(&self, owner: Uuid, invoice_id: Uuid, payment_id: Uuid) -> Result<(), CoreError>;
    async fn suggest_payments(&self, owner: Uuid, invoice_id: Uuid, limit: usize) -> Result<Vec<Suggestion<Payment>>, CoreError>;
    /// Re-run the parse pipeline's XML/OCR extraction over the invoice's
    /// already-stored file, replacing extracted fields without touching
    /// `dedup_status`/`is_draft`.
    async fn reparse(&self, owner: Uuid, id: Uuid) -> Result<Invoice, CoreError>;
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn create_from_json(&self, payment: Payment) -> Result<Payment, CoreError>;
    async fn create_draft_from_screenshot(&self, payment: Payment) -> Result<Payment, CoreError>;
    async fn list(&self, owner: Uuid) -> Result<Vec<Payment>, CoreError>;
    async fn get(&self, owner: Uuid, id: Uuid) -> Result<Payment, CoreError>;
    /// Edit a draft or confirmed payment; same confirm-routing rule as
    /// [`InvoiceService::update`].
    async fn update(&self, payment: Payment, force_duplicate_save: bool) -> Result<Payment, CoreError>;
    async fn delete(&self, owner: Uuid, id: Uuid) -> Result<(), CoreError>;
    async fn suggest_invoices(&self, owner: Uuid, payment_id: Uuid, limit: usize) -> Result<Vec<Suggestion<Invoice>>, CoreError>;
    /// Re-run OCR over the payment's already-stored screenshot, replacing
    /// extracted fields without touching `dedup_status`/`is_draft`.
    async fn reparse_screenshot(&self, owner: Uuid, id: Uuid) -> Result<Payment, CoreError>;
}

#[async_trait]
pub trait TripService: Send + Sync {
    async fn create(&self, trip: Trip) -> Result<Vec<Uuid>, CoreError>;
    async fn list(&self, owner: Uuid) -> Result<Vec<Trip>, CoreError>;
    async fn update(&self, owner: Uuid, previous_id: Uuid, updated: Trip) -> Result<Vec<Uuid>, CoreError>;
    async fn delete_with_options(&self, owner: Uuid, trip_id: Uuid, delete_payments: bool) -> Result<Vec<Uuid>, CoreError>;
    async fn payments(&self, owner: Uuid, trip_id: Uuid) -> Result<Vec<Payment>, CoreError>;
    async fn pending_payments(&self, owner: Uuid) -> Result<Vec<Payment>, CoreError>;
    async fn assign_pending(&self, owner: Uuid, payment_id: Uuid, trip_id: Uuid) -> Result<Payment, CoreError>;
    async fn block_pending(&self, owner: Uuid, payment_id: Uuid) -> Result<Payment, CoreError>;
    async fn cascade_preview(&self, owner: Uuid, trip_id: Uuid) -> Result<Vec<Payment>, CoreError>;
    async fn summary(&self, owner: Uuid, trip_id: Uuid) -> Result<crate::model::TripSummary, CoreError>;
    async fn all_summaries(&self, owner: Uuid) -> Result<Vec<crate::model::TripSummary>, CoreError>;
}

#[async_trait]
pub trait RegressionService: Send + Sync {
    async fn create_from_payment(&self, payment: &Payment, name: String) -> Result<RegressionSample, CoreError>;
    async fn create_from_invoice(&self, invoice: &Invoice, name: String) -> Result<RegressionSample, CoreError>;
    async fn list(&self) -> Result<Vec<RegressionSample>, CoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), CoreError>;
    async fn bulk_delete(&self, ids: &[Uuid]) -> Result<(), CoreError>;
    async fn export_zip(&self) -> Result<Vec<u8>, CoreError>;
    async fn import_repo_samples(&self, zip_bytes: &[u8]) -> Result<u32, CoreError>;
}

pub struct SmartBillManager {
    pub store: Arc<dyn Store>,
    pub fetcher: HttpFetcher,
    pub ocr: Arc<dyn OcrEngine>,
    pub ocr_cache: OcrCache,
    pub registry: SharedRegistry,
    pub uploads_dir: String,
}

impl SmartBillManager {
    pub fn new(store: Arc<dyn Store>, fetcher: HttpFetcher, ocr: Arc<dyn OcrEngine>, config: &Config) -> Self {
        Self {
            store,
            fetcher,
            ocr,
            ocr_cache: OcrCache::new(config.ocr_cache_ttl_hours),
            registry: Arc::new(ConnectionRegistry::new()),
            uploads_dir: config.data_dir.clone(),
        }
    }

    /// Spawn the task-runner worker/reaper and, if enabled, the draft-cleanup
    /// sweeper. IMAP monitor tasks are spawned separately, per config, via
    /// [`Self::start_monitoring`].
    pub fn spawn_background_tasks(
        &self,
        executors: Arc<dyn Fn(TaskType) -> Arc<dyn TaskExecutor> + Send + Sync>,
        config: &Config,
        shutdown: ShutdownChannel,
    ) -> Vec<CoreTask<()>> {
        let mut tasks = vec![
            task_runner::spawn_worker(self.store.clone(), executors, shutdown.clone()),
            task_runner::spawn_reaper(
                self.store.clone(),
                config.task_reaper_interval,
                config.task_processing_ttl,
                shutdown.clone(),
            ),
        ];
        if config.draft_cleanup_enabled() {
            tasks.push(draft::spawn_cleanup_sweeper(
                self.store.clone(),
                self.uploads_dir.clone(),
                Duration::from_secs(config.draft_cleanup_interval_minutes as u64 * 60),
                Duration::from_secs(config.draft_ttl_hours as u64 * 3600),
                shutdown,
            ));
        }
        tasks
    }

    /// Start (or restart) the background IMAP monitor for `config`.
    pub async fn start_monitoring<S: ImapSession + 'static>(&self, config: EmailConfig, mailbox: String, session: S) {
        let shutdown = ShutdownChannel::new();
        let config_id = config.id;
        let task = manager::spawn(config, mailbox, session, self.store.clone(), shutdown.clone());
        self.registry.start(config_id, shutdown, task).await;
    }

    pub async fn stop_monitoring(&self, config_id: Uuid) {
        self.registry.stop(config_id).await;
    }

    pub async fn is_monitoring(&self, config_id: Uuid) -> bool {
        self.registry.is_monitoring(config_id).await
    }

    /// Run one on-demand sync cycle, outside the background monitor loop.
    pub async fn manual_check<S: ImapSession>(&self, session: &mut S, config: &EmailConfig, mailbox: &str) -> Result<(), CoreError> {
        manager::manual_check(session, &self.store, config, mailbox)
            .await
            .map_err(|e| CoreError::new(CoreErrorKind::RemoteFetchFailed, e.to_string()))
    }

    /// OCR a stored screenshot (through the OCR-text cache) and run field
    /// extraction over the result; shared by draft creation and reparse.
    async fn extract_payment_fields(&self, screenshot_path: &str) -> Result<ExtractedPaymentData, CoreError> {
        let abs_path = path::resolve(&self.uploads_dir, screenshot_path);
        let bytes = tokio::fs::read(&abs_path)
            .await
            .map_err(|e| CoreError::new(CoreErrorKind::ParseError, format!("failed to read screenshot: {e}")))?;
        let cache_key = OcrCache::key_for(&bytes);
        let text = match self.ocr_cache.get(&cache_key).await {
            Some(cached) => cached,
            None => {
                let result = self.ocr.extract_text_from_image(&bytes).await?;
                self.ocr_cache.put(cache_key, result.raw_text.clone()).await;
                result.raw_text
            }
        };
        Ok(payment_text::parse_payment_text(&text))
    }

    /// Non-blocking duplicate preview: marks `dedup_status=suspected` so the
    /// UI can surface it, without rejecting the draft. Confirm (§4.7) is
    /// where a hash duplicate actually blocks.
    async fn mark_duplicate_preview(&self, payment: &mut Payment) -> Result<(), CoreError> {
        if let Some(sha) = payment.file_sha256.clone() {
            if self.store.find_payment_by_hash(payment.owner, &sha, Some(payment.id)).await?.is_some() {
                payment.dedup_status = DedupStatus::Suspected;
                return Ok(());
            }
        }
        if let Some(ts) = payment.transaction_time_ts {
            let candidates = self
                .store
                .find_payments_by_amount_and_time(payment.owner, payment.amount, ts.as_i64(), Some(payment.id))
                .await?;
            if !candidates.is_empty() {
                payment.dedup_status = DedupStatus::Suspected;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskService for SmartBillManager {
    async fn create(&self, owner: Uuid, task_type: TaskType, target_id: Uuid, sha: Option<&str>) -> Result<Task, CoreError> {
        task_runner::create_task(self.store.as_ref(), task_type, owner, target_id, sha).await
    }

    async fn get(&self, owner: Uuid, id: Uuid) -> Result<Task, CoreError> {
        let task = self.store.get_task(id).await?.ok_or_else(not_found)?;
        require_owner(owner, task.created_by)?;
        Ok(task)
    }

    async fn cancel(&self, owner: Uuid, id: Uuid) -> Result<bool, CoreError> {
        let task = self.store.get_task(id).await?.ok_or_else(not_found)?;
        require_owner(owner, task.created_by)?;
        task_runner::cancel_task(self.store.as_ref(), id).await
    }
}

#[async_trait]
impl EmailService for SmartBillManager {
    async fn create_config(&self, config: EmailConfig) -> Result<EmailConfig, CoreError> {
        self.store.put_email_config(config.clone()).await?;
        Ok(config)
    }

    async fn list_configs(&self, owner: Uuid) -> Result<Vec<EmailConfig>, CoreError> {
        self.store.list_email_configs(owner).await
    }

    async fn get_config(&self, owner: Uuid, id: Uuid) -> Result<EmailConfig, CoreError> {
        let config = self.store.get_email_config(id).await?.ok_or_else(not_found)?;
        require_owner(owner, config.owner)?;
        Ok(config)
    }

    async fn update_config(&self, config: EmailConfig) -> Result<EmailConfig, CoreError> {
        self.store.put_email_config(config.clone()).await?;
        Ok(config)
    }

    async fn delete_config(&self, owner: Uuid, id: Uuid) -> Result<(), CoreError> {
        self.get_config(owner, id).await?;
        self.registry.stop(id).await;
        self.store.delete_email_config(id).await
    }

    async fn logs(&self, owner: Uuid, config_id: Uuid, mailbox: &str) -> Result<Vec<EmailLog>, CoreError> {
        self.get_config(owner, config_id).await?;
        self.store.list_email_logs_in_mailbox(owner, config_id, mailbox).await
    }

    async fn parse_log(&self, owner: Uuid, log: EmailLog, raw_message: &[u8]) -> Result<EmailLog, CoreError> {
        require_owner(owner, log.owner)?;
        let ctx = pipeline::PipelineContext {
            store: self.store.as_ref(),
            fetcher: &self.fetcher,
            ocr: self.ocr.as_ref(),
            ocr_cache: &self.ocr_cache,
            uploads_dir: &self.uploads_dir,
        };
        pipeline::parse_log(&ctx, log, raw_message).await
    }

    async fn export_eml(&self, owner: Uuid, log: EmailLog, raw_message: &[u8]) -> Result<(String, Vec<u8>), CoreError> {
        require_owner(owner, log.owner)?;
        let stem = log.subject.as_deref().map(crate::path::sanitize_filename).unwrap_or_else(|| log.message_uid.to_string());
        Ok((format!("{stem}.eml"), raw_message.to_vec()))
    }
}

#[async_trait]
impl InvoiceService for SmartBillManager {
    async fn upload(&self, invoice: Invoice) -> Result<Invoice, CoreError> {
        self.store.put_invoice(invoice.clone()).await?;
        Ok(invoice)
    }

    async fn list(&self, owner: Uuid) -> Result<Vec<Invoice>, CoreError> {
        self.store.list_invoices(owner).await
    }

    async fn get(&self, owner: Uuid, id: Uuid) -> Result<Invoice, CoreError> {
        let invoice = self.store.get_invoice(id).await?.ok_or_else(not_found)?;
        require_owner(owner, invoice.owner)?;
        Ok(invoice)
    }

    async fn update(&self, invoice: Invoice, force_duplicate_save: bool) -> Result<Invoice, CoreError> {
        let was_draft = match self.store.get_invoice(invoice.id).await? {
            Some(existing) => existing.is_draft,
            None => invoice.is_draft,
        };
        if was_draft && !invoice.is_draft {
            draft::confirm_invoice(self.store.as_ref(), invoice, force_duplicate_save).await
        } else {
            self.store.put_invoice(invoice.clone()).await?;
            Ok(invoice)
        }
    }

    async fn reparse(&self, owner: Uuid, id: Uuid) -> Result<Invoice, CoreError> {
        let invoice = self.get(owner, id).await?;
        let ctx = pipeline::PipelineContext {
            store: self.store.as_ref(),
            fetcher: &self.fetcher,
            ocr: self.ocr.as_ref(),
            ocr_cache: &self.ocr_cache,
            uploads_dir: &self.uploads_dir,
        };
        pipeline::reparse_invoice(&ctx, invoice).await
    }

    async fn delete(&self, owner: Uuid, id: Uuid) -> Result<(), CoreError> {
        self.get(owner, id).await?;
        for link in self.store.links_for_invoice(id).await? {
            self.store.unlink_invoice_payment(link).await?;
        }
        self.store.delete_invoice(id).await
    }

    async fn link_payment(&self, owner: Uuid, invoice_id: Uuid, payment_id: Uuid) -> Result<(), CoreError> {
        self.get(owner, invoice_id).await?;
        self.store.link_invoice_payment(InvoicePaymentLink { invoice_id, payment_id }).await
    }

    async fn unlink_payment(&self, owner: Uuid, invoice_id: Uuid, payment_id: Uuid) -> Result<(), CoreError> {
        self.get(owner, invoice_id).await?;
        self.store.unlink_invoice_payment(InvoicePaymentLink { invoice_id, payment_id }).await
    }

    async fn suggest_payments(&self, owner: Uuid, invoice_id: Uuid, limit: usize) -> Result<Vec<Suggestion<Payment>>, CoreError> {
        let invoice = self.get(owner, invoice_id).await?;
        matcher::suggest_payments(self.store.as_ref(), &invoice, limit).await
    }
}

#[async_trait]
impl PaymentService for SmartBillManager {
    /// JSON-entry payment: confirmed immediately, requiring a valid RFC3339
    /// `transaction_time`.
    async fn create_from_json(&self, mut payment: Payment) -> Result<Payment, CoreError> {
        let rfc3339 = payment
            .transaction_time
            .as_deref()
            .ok_or_else(|| CoreError::new(CoreErrorKind::MissingTransactionTime, "transaction_time is required"))?;
        let ts = TimestampMillis::parse_rfc3339(rfc3339).map_err(|e| CoreError::new(CoreErrorKind::ParseError, e.to_string()))?;
        payment.transaction_time_ts = Some(ts);
        payment.is_draft = false;
        let confirmed = draft::confirm_payment(self.store.as_ref(), payment, false).await?;
        trip_assign::recompute_payment_assignment(self.store.as_ref(), confirmed).await
    }

    /// Screenshot-entry payment: OCR + field parsing + a non-blocking dedup
    /// mark, left as a draft. If OCR could not infer a transaction time the
    /// record keeps none (the placeholder case) and the caller must fill one
    /// in before confirming.
    async fn create_draft_from_screenshot(&self, mut payment: Payment) -> Result<Payment, CoreError> {
        if let Some(screenshot_path) = payment.screenshot_path.clone() {
            match self.extract_payment_fields(&screenshot_path).await {
                Ok(parsed) => {
                    if let Some(amount) = parsed.amount {
                        payment.amount = amount;
                    }
                    if payment.merchant.is_none() {
                        payment.merchant = parsed.merchant.clone();
                    }
                    if payment.transaction_time.is_none() {
                        payment.transaction_time = parsed.transaction_time.clone();
                        payment.transaction_time_ts =
                            parsed.transaction_time.as_deref().and_then(|t| TimestampMillis::parse_rfc3339(t).ok());
                    }
                    payment.extracted_data = serde_json::to_value(&parsed).unwrap_or(serde_json::Value::Null);
                }
                Err(e) => warn!(error = %e, "screenshot OCR failed, leaving fields as submitted"),
            }
        }

        self.mark_duplicate_preview(&mut payment).await?;
        self.store.put_payment(payment.clone()).await?;
        Ok(payment)
    }

    async fn list(&self, owner: Uuid) -> Result<Vec<Payment>, CoreError> {
        self.store.list_payments(owner).await
    }

    async fn get(&self, owner: Uuid, id: Uuid) -> Result<Payment, CoreError> {
        let payment = self.store.get_payment(id).await?.ok_or_else(not_found)?;
        require_owner(owner, payment.owner)?;
        Ok(payment)
    }

    async fn update(&self, payment: Payment, force_duplicate_save: bool) -> Result<Payment, CoreError> {
        let was_draft = match self.store.get_payment(payment.id).await? {
            Some(existing) => existing.is_draft,
            None => payment.is_draft,
        };
        let payment = if was_draft && !payment.is_draft {
            draft::confirm_payment(self.store.as_ref(), payment, force_duplicate_save).await?
        } else {
            self.store.put_payment(payment.clone()).await?;
            payment
        };
        trip_assign::recompute_payment_assignment(self.store.as_ref(), payment).await
    }

    async fn delete(&self, owner: Uuid, id: Uuid) -> Result<(), CoreError> {
        PaymentService::get(self, owner, id).await?;
        for link in self.store.links_for_payment(id).await? {
            self.store.unlink_invoice_payment(link).await?;
        }
        self.store.delete_payment(id).await
    }

    async fn suggest_invoices(&self, owner: Uuid, payment_id: Uuid, limit: usize) -> Result<Vec<Suggestion<Invoice>>, CoreError> {
        let payment = PaymentService::get(self, owner, payment_id).await?;
        matcher::suggest_invoices(self.store.as_ref(), &payment, limit).await
    }

    async fn reparse_screenshot(&self, owner: Uuid, id: Uuid) -> Result<Payment, CoreError> {
        let mut payment = PaymentService::get(self, owner, id).await?;
        let screenshot_path = payment
            .screenshot_path
            .clone()
            .ok_or_else(|| CoreError::new(CoreErrorKind::ParseError, "payment has no screenshot to reparse"))?;
        let parsed = self.extract_payment_fields(&screenshot_path).await?;
        if let Some(amount) = parsed.amount {
            payment.amount = amount;
        }
        payment.merchant = parsed.merchant.clone();
        if let Some(t) = &parsed.transaction_time {
            payment.transaction_time = Some(t.clone());
            payment.transaction_time_ts = TimestampMillis::parse_rfc3339(t).ok();
        }
        payment.extracted_data = serde_json::to_value(&parsed).unwrap_or(serde_json::Value::Null);
        self.store.put_payment(payment.clone()).await?;
        Ok(payment)
    }
}

#[async_trait]
impl TripService for SmartBillManager {
    async fn create(&self, trip: Trip) -> Result<Vec<Uuid>, CoreError> {
        trip.validate()?;
        self.store.put_trip(trip.clone()).await?;
        trip_assign::recompute_for_trip_change(self.store.as_ref(), trip.owner, None, Some((trip.start_time_ts, trip.end_time_ts))).await
    }

    async fn list(&self, owner: Uuid) -> Result<Vec<Trip>, CoreError> {
        self.store.list_trips(owner).await
    }

    /// Move (or otherwise edit the time bounds of) a trip. Rejected if the
    /// trip is currently bad-debt locked.
    async fn update(&self, owner: Uuid, previous_id: Uuid, updated: Trip) -> Result<Vec<Uuid>, CoreError> {
        let previous = self.store.get_trip(previous_id).await?.ok_or_else(not_found)?;
        require_owner(owner, previous.owner)?;
        trip_assign::enforce_not_locked(self.store.as_ref(), previous_id).await?;
        updated.validate()?;
        self.store.put_trip(updated.clone()).await?;
        trip_assign::recompute_for_trip_change(
            self.store.as_ref(),
            updated.owner,
            Some((previous.start_time_ts, previous.end_time_ts)),
            Some((updated.start_time_ts, updated.end_time_ts)),
        )
        .await
    }

    async fn delete_with_options(&self, owner: Uuid, trip_id: Uuid, delete_payments: bool) -> Result<Vec<Uuid>, CoreError> {
        let trip = self.store.get_trip(trip_id).await?.ok_or_else(not_found)?;
        require_owner(owner, trip.owner)?;
        trip_assign::enforce_not_locked(self.store.as_ref(), trip_id).await?;

        if delete_payments {
            let members: Vec<Payment> = self
                .store
                .list_payments(trip.owner)
                .await?
                .into_iter()
                .filter(|p| p.trip_id == Some(trip_id))
                .collect();
            for payment in members {
                for link in self.store.links_for_payment(payment.id).await? {
                    self.store.unlink_invoice_payment(link).await?;
                }
                self.store.delete_payment(payment.id).await?;
            }
        }

        self.store.delete_trip(trip_id).await?;
        trip_assign::recompute_for_trip_change(self.store.as_ref(), trip.owner, Some((trip.start_time_ts, trip.end_time_ts)), None).await
    }

    async fn payments(&self, owner: Uuid, trip_id: Uuid) -> Result<Vec<Payment>, CoreError> {
        let trip = self.store.get_trip(trip_id).await?.ok_or_else(not_found)?;
        require_owner(owner, trip.owner)?;
        Ok(self.store.list_payments(trip.owner).await?.into_iter().filter(|p| p.trip_id == Some(trip_id)).collect())
    }

    async fn pending_payments(&self, owner: Uuid) -> Result<Vec<Payment>, CoreError> {
        Ok(self
            .store
            .list_payments(owner)
            .await?
            .into_iter()
            .filter(|p| !p.is_draft && matches!(p.trip_assignment_state, TripAssignmentState::Overlap | TripAssignmentState::NoMatch))
            .collect())
    }

    async fn assign_pending(&self, owner: Uuid, payment_id: Uuid, trip_id: Uuid) -> Result<Payment, CoreError> {
        let payment = self.store.get_payment(payment_id).await?.ok_or_else(not_found)?;
        require_owner(owner, payment.owner)?;
        trip_assign::assign_pending(self.store.as_ref(), payment_id, trip_id).await
    }

    async fn block_pending(&self, owner: Uuid, payment_id: Uuid) -> Result<Payment, CoreError> {
        let payment = self.store.get_payment(payment_id).await?.ok_or_else(not_found)?;
        require_owner(owner, payment.owner)?;
        trip_assign::block_pending(self.store.as_ref(), payment_id).await
    }

    /// Preview of what `delete_with_options(delete_payments=true)` would
    /// remove, without mutating anything.
    async fn cascade_preview(&self, owner: Uuid, trip_id: Uuid) -> Result<Vec<Payment>, CoreError> {
        TripService::payments(self, owner, trip_id).await
    }

    async fn summary(&self, owner: Uuid, trip_id: Uuid) -> Result<crate::model::TripSummary, CoreError> {
        let trip = self.store.get_trip(trip_id).await?.ok_or_else(not_found)?;
        require_owner(owner, trip.owner)?;
        trip_assign::summary(self.store.as_ref(), trip).await
    }

    async fn all_summaries(&self, owner: Uuid) -> Result<Vec<crate::model::TripSummary>, CoreError> {
        trip_assign::all_summaries(self.store.as_ref(), owner).await
    }
}

#[async_trait]
impl RegressionService for SmartBillManager {
    async fn create_from_payment(&self, payment: &Payment, name: String) -> Result<RegressionSample, CoreError> {
        regression::create_from_payment(self.store.as_ref(), payment, name).await
    }

    async fn create_from_invoice(&self, invoice: &Invoice, name: String) -> Result<RegressionSample, CoreError> {
        regression::create_from_invoice(self.store.as_ref(), invoice, name).await
    }

    async fn list(&self) -> Result<Vec<RegressionSample>, CoreError> {
        regression::list(self.store.as_ref()).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        regression::delete(self.store.as_ref(), id).await
    }

    async fn bulk_delete(&self, ids: &[Uuid]) -> Result<(), CoreError> {
        regression::bulk_delete(self.store.as_ref(), ids).await
    }

    async fn export_zip(&self) -> Result<Vec<u8>, CoreError> {
        let samples = regression::list(self.store.as_ref()).await?;
        regression::export_zip(&samples)
    }

    async fn import_repo_samples(&self, zip_bytes: &[u8]) -> Result<u32, CoreError> {
        regression::import_repo_samples(self.store.as_ref(), zip_bytes).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{DedupStatus, InvoiceSource, ParseStatus, ReimburseStatus, TripAssignmentSource};
    use crate::ocr::StubOcrEngine;
    use crate::store::memory::MemoryStore;

    fn manager() -> SmartBillManager {
        let config = Config {
            draft_ttl_hours: 6,
            draft_cleanup_interval_minutes: 15,
            task_processing_ttl: Duration::from_secs(3600),
            task_reaper_interval: Duration::from_secs(30),
            ocr_cache_ttl_hours: 0,
            ocr_cache_dir: "/tmp".to_string(),
            data_dir: "/tmp/sbm-test-uploads".to_string(),
            regression_samples_dir: None,
        };
        SmartBillManager::new(
            Arc::new(MemoryStore::new()),
            HttpFetcher::new(4).unwrap(),
            Arc::new(StubOcrEngine { fixed_text: String::new() }),
            &config,
        )
    }

    fn draft_payment(owner: Uuid) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            owner,
            is_draft: true,
            amount: 10.0,
            merchant: None,
            category: None,
            payment_method: None,
            description: None,
            transaction_time: Some("2025-10-04T12:00:00Z".to_string()),
            transaction_time_ts: None,
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
            bad_debt: false,
            created_at: TimestampMillis::now(),
        }
    }

    fn sample_trip(owner: Uuid) -> Trip {
        Trip {
            id: Uuid::new_v4(),
            owner,
            name: "Trip".to_string(),
            start_time: "2025-10-01T00:00:00Z".to_string(),
            end_time: "2025-10-10T00:00:00Z".to_string(),
            start_time_ts: TimestampMillis::parse_rfc3339("2025-10-01T00:00:00Z").unwrap(),
            end_time_ts: TimestampMillis::parse_rfc3339("2025-10-10T00:00:00Z").unwrap(),
            timezone: "UTC".to_string(),
            reimburse_status: ReimburseStatus::Unreimbursed,
            note: None,
        }
    }

    #[tokio::test]
    async fn create_payment_from_json_confirms_and_assigns_trip() {
        let sbm = manager();
        let owner = Uuid::new_v4();
        let trip = sample_trip(owner);
        TripService::create(&sbm, trip.clone()).await.unwrap();

        let mut payment = draft_payment(owner);
        payment.is_draft = false;
        let created = PaymentService::create_from_json(&sbm, payment).await.unwrap();
        assert!(!created.is_draft);
        assert_eq!(created.trip_id, Some(trip.id));
        assert_eq!(created.trip_assignment_state, TripAssignmentState::Assigned);
    }

    #[tokio::test]
    async fn delete_invoice_cleans_up_links() {
        let sbm = manager();
        let owner = Uuid::new_v4();
        let inv = InvoiceService::upload(&sbm, sample_invoice(owner)).await.unwrap();
        let mut payment = draft_payment(owner);
        payment.is_draft = false;
        let pay = PaymentService::create_draft_from_screenshot(&sbm, payment).await.unwrap();
        InvoiceService::link_payment(&sbm, owner, inv.id, pay.id).await.unwrap();

        InvoiceService::delete(&sbm, owner, inv.id).await.unwrap();
        assert!(sbm.store.links_for_payment(pay.id).await.unwrap().is_empty());
        assert!(InvoiceService::get(&sbm, owner, inv.id).await.is_err());
    }

    #[tokio::test]
    async fn cross_owner_get_reads_as_not_found() {
        let sbm = manager();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let inv = InvoiceService::upload(&sbm, sample_invoice(owner)).await.unwrap();

        let result = InvoiceService::get(&sbm, other, inv.id).await;
        assert!(matches!(result, Err(ref e) if e.kind == CoreErrorKind::NotFound));
    }

    #[tokio::test]
    async fn locked_trip_rejects_delete_with_options() {
        let sbm = manager();
        let owner = Uuid::new_v4();
        let trip = sample_trip(owner);
        TripService::create(&sbm, trip.clone()).await.unwrap();

        let mut payment = draft_payment(owner);
        payment.is_draft = false;
        payment.bad_debt = true;
        payment.trip_id = Some(trip.id);
        sbm.store.put_payment(payment.clone()).await.unwrap();

        let invoice_id = Uuid::new_v4();
        let mut inv = sample_invoice(owner);
        inv.id = invoice_id;
        sbm.store.put_invoice(inv).await.unwrap();
        sbm.store
            .link_invoice_payment(InvoicePaymentLink { invoice_id, payment_id: payment.id })
            .await
            .unwrap();

        let result = TripService::delete_with_options(&sbm, owner, trip.id, true).await;
        assert!(matches!(result, Err(ref e) if e.kind == CoreErrorKind::TripBadDebtLocked));
    }
}
