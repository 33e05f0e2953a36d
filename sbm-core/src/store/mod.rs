//! The single persistence seam every stateful component calls through.
//! Schema migration and the concrete database are out of scope; this trait
//! only fixes the contract collaborators need, mirroring how
//! `LexeInnerPersister` is the single persistence seam for payment/channel
//! state in the teacher crate.

use async_trait::async_trait;
use uuid::Uuid;

use sbm_common::error::CoreError;

use crate::model::{
    EmailConfig, EmailLog, Invoice, InvoiceAttachment, InvoicePaymentLink, Payment,
    RegressionSample, Task, TaskStatus, Trip,
};

pub mod memory;

/// All the storage operations `sbm-core` components need. A concrete
/// database-backed implementation lives outside this crate; [`memory::MemoryStore`]
/// is the in-memory reference implementation used to drive the state
/// machines in tests.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // --- email configs / logs --- //
    async fn get_email_config(&self, id: Uuid) -> Result<Option<EmailConfig>, CoreError>;
    async fn list_email_configs(&self, owner: Uuid) -> Result<Vec<EmailConfig>, CoreError>;
    async fn put_email_config(&self, config: EmailConfig) -> Result<(), CoreError>;
    async fn delete_email_config(&self, id: Uuid) -> Result<(), CoreError>;

    async fn find_email_log(
        &self,
        owner: Uuid,
        email_config_id: Uuid,
        mailbox: &str,
        message_uid: u32,
    ) -> Result<Option<EmailLog>, CoreError>;
    async fn put_email_log(&self, log: EmailLog) -> Result<(), CoreError>;
    async fn list_email_logs_in_mailbox(
        &self,
        owner: Uuid,
        email_config_id: Uuid,
        mailbox: &str,
    ) -> Result<Vec<EmailLog>, CoreError>;
    async fn mark_logs_deleted(&self, ids: &[Uuid]) -> Result<(), CoreError>;

    // --- invoices --- //
    async fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>, CoreError>;
    async fn put_invoice(&self, invoice: Invoice) -> Result<(), CoreError>;
    async fn delete_invoice(&self, id: Uuid) -> Result<(), CoreError>;
    async fn list_invoices(&self, owner: Uuid) -> Result<Vec<Invoice>, CoreError>;
    async fn find_invoice_by_hash(
        &self,
        owner: Uuid,
        sha256: &str,
        exclude: Option<Uuid>,
    ) -> Result<Option<Invoice>, CoreError>;
    async fn find_invoices_by_number(
        &self,
        owner: Uuid,
        invoice_number: &str,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Invoice>, CoreError>;

    // --- invoice attachments (itinerary tables etc.) --- //
    async fn put_invoice_attachment(&self, attachment: InvoiceAttachment) -> Result<(), CoreError>;
    async fn attachments_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<InvoiceAttachment>, CoreError>;

    // --- payments --- //
    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>, CoreError>;
    async fn put_payment(&self, payment: Payment) -> Result<(), CoreError>;
    async fn delete_payment(&self, id: Uuid) -> Result<(), CoreError>;
    async fn list_payments(&self, owner: Uuid) -> Result<Vec<Payment>, CoreError>;
    /// Every draft invoice across every owner created before `older_than_ms`,
    /// for the TTL cleanup sweep. Not owner-scoped: the sweep is global.
    async fn list_stale_draft_invoices(&self, older_than_ms: i64) -> Result<Vec<Invoice>, CoreError>;
    /// Every draft payment across every owner created before `older_than_ms`.
    async fn list_stale_draft_payments(&self, older_than_ms: i64) -> Result<Vec<Payment>, CoreError>;
    async fn find_payment_by_hash(
        &self,
        owner: Uuid,
        sha256: &str,
        exclude: Option<Uuid>,
    ) -> Result<Option<Payment>, CoreError>;
    async fn find_payments_by_amount_and_time(
        &self,
        owner: Uuid,
        amount: f64,
        ts_ms: i64,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Payment>, CoreError>;

    // --- invoice <-> payment links --- //
    async fn link_invoice_payment(&self, link: InvoicePaymentLink) -> Result<(), CoreError>;
    async fn unlink_invoice_payment(&self, link: InvoicePaymentLink) -> Result<(), CoreError>;
    async fn links_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<InvoicePaymentLink>, CoreError>;
    async fn links_for_payment(&self, payment_id: Uuid) -> Result<Vec<InvoicePaymentLink>, CoreError>;

    // --- trips --- //
    async fn get_trip(&self, id: Uuid) -> Result<Option<Trip>, CoreError>;
    async fn put_trip(&self, trip: Trip) -> Result<(), CoreError>;
    async fn delete_trip(&self, id: Uuid) -> Result<(), CoreError>;
    async fn list_trips(&self, owner: Uuid) -> Result<Vec<Trip>, CoreError>;

    // --- tasks --- //
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, CoreError>;
    async fn put_task(&self, task: Task) -> Result<(), CoreError>;
    async fn find_task_idempotent(
        &self,
        task_type: crate::model::TaskType,
        created_by: Uuid,
        target_id: Uuid,
        file_sha256: Option<&str>,
    ) -> Result<Option<Task>, CoreError>;
    /// Find and claim one queued task in `(created_at, id)` order. Returns
    /// `None` if no queued task exists or another worker won the race.
    async fn claim_next_queued_task(&self) -> Result<Option<Task>, CoreError>;
    async fn update_task_status(
        &self,
        id: Uuid,
        expect: TaskStatus,
        set: TaskStatus,
    ) -> Result<bool, CoreError>;
    async fn list_stuck_processing_tasks(&self, older_than_ms: i64) -> Result<Vec<Task>, CoreError>;

    // --- regression samples --- //
    async fn put_regression_sample(&self, sample: RegressionSample) -> Result<(), CoreError>;
    async fn list_regression_samples(&self) -> Result<Vec<RegressionSample>, CoreError>;
    async fn delete_regression_sample(&self, id: Uuid) -> Result<(), CoreError>;
    async fn find_regression_sample_by_hash(
        &self,
        kind: crate::model::RegressionKind,
        raw_hash: &str,
    ) -> Result<Option<RegressionSample>, CoreError>;
}
