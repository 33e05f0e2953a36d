//! An in-memory [`Store`] reference implementation, sufficient for driving
//! the state machines in unit tests. Not a production database.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use sbm_common::error::CoreError;

use crate::model::{
    EmailConfig, EmailLog, EmailLogStatus, Invoice, InvoiceAttachment, InvoicePaymentLink, Payment,
    RegressionKind, RegressionSample, Task, TaskStatus, TaskType, Trip,
};

use super::Store;

#[derive(Default)]
struct Tables {
    email_configs: HashMap<Uuid, EmailConfig>,
    email_logs: HashMap<Uuid, EmailLog>,
    invoices: HashMap<Uuid, Invoice>,
    payments: HashMap<Uuid, Payment>,
    links: Vec<InvoicePaymentLink>,
    trips: HashMap<Uuid, Trip>,
    tasks: HashMap<Uuid, Task>,
    regression_samples: HashMap<Uuid, RegressionSample>,
    invoice_attachments: HashMap<Uuid, InvoiceAttachment>,
}

/// A `Mutex`-guarded in-memory store. Single-process, not durable.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_email_config(&self, id: Uuid) -> Result<Option<EmailConfig>, CoreError> {
        Ok(self.tables.lock().await.email_configs.get(&id).cloned())
    }

    async fn list_email_configs(&self, owner: Uuid) -> Result<Vec<EmailConfig>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .email_configs
            .values()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect())
    }

    async fn put_email_config(&self, config: EmailConfig) -> Result<(), CoreError> {
        self.tables.lock().await.email_configs.insert(config.id, config);
        Ok(())
    }

    async fn delete_email_config(&self, id: Uuid) -> Result<(), CoreError> {
        self.tables.lock().await.email_configs.remove(&id);
        Ok(())
    }

    async fn find_email_log(
        &self,
        owner: Uuid,
        email_config_id: Uuid,
        mailbox: &str,
        message_uid: u32,
    ) -> Result<Option<EmailLog>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .email_logs
            .values()
            .find(|l| {
                l.owner == owner
                    && l.email_config_id == email_config_id
                    && l.mailbox == mailbox
                    && l.message_uid == message_uid
            })
            .cloned())
    }

    async fn put_email_log(&self, log: EmailLog) -> Result<(), CoreError> {
        self.tables.lock().await.email_logs.insert(log.id, log);
        Ok(())
    }

    async fn list_email_logs_in_mailbox(
        &self,
        owner: Uuid,
        email_config_id: Uuid,
        mailbox: &str,
    ) -> Result<Vec<EmailLog>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .email_logs
            .values()
            .filter(|l| {
                l.owner == owner && l.email_config_id == email_config_id && l.mailbox == mailbox
            })
            .cloned()
            .collect())
    }

    async fn mark_logs_deleted(&self, ids: &[Uuid]) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        for id in ids {
            if let Some(log) = tables.email_logs.get_mut(id) {
                log.status = EmailLogStatus::Deleted;
            }
        }
        Ok(())
    }

    async fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>, CoreError> {
        Ok(self.tables.lock().await.invoices.get(&id).cloned())
    }

    async fn put_invoice(&self, invoice: Invoice) -> Result<(), CoreError> {
        self.tables.lock().await.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    async fn delete_invoice(&self, id: Uuid) -> Result<(), CoreError> {
        self.tables.lock().await.invoices.remove(&id);
        Ok(())
    }

    async fn list_invoices(&self, owner: Uuid) -> Result<Vec<Invoice>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .invoices
            .values()
            .filter(|i| i.owner == owner)
            .cloned()
            .collect())
    }

    async fn find_invoice_by_hash(
        &self,
        owner: Uuid,
        sha256: &str,
        exclude: Option<Uuid>,
    ) -> Result<Option<Invoice>, CoreError> {
        let tables = self.tables.lock().await;
        let mut matches: Vec<&Invoice> = tables
            .invoices
            .values()
            .filter(|i| {
                i.owner == owner
                    && i.file_sha256.as_deref() == Some(sha256)
                    && Some(i.id) != exclude
            })
            .collect();
        // Prefer a non-draft match, per the hash-duplicate rule.
        matches.sort_by_key(|i| i.is_draft);
        Ok(matches.first().map(|i| (*i).clone()))
    }

    async fn find_invoices_by_number(
        &self,
        owner: Uuid,
        invoice_number: &str,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Invoice>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .invoices
            .values()
            .filter(|i| {
                i.owner == owner
                    && !i.is_draft
                    && i.invoice_number.as_deref() == Some(invoice_number)
                    && Some(i.id) != exclude
            })
            .cloned()
            .collect())
    }

    async fn put_invoice_attachment(&self, attachment: InvoiceAttachment) -> Result<(), CoreError> {
        self.tables.lock().await.invoice_attachments.insert(attachment.id, attachment);
        Ok(())
    }

    async fn attachments_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<InvoiceAttachment>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .invoice_attachments
            .values()
            .filter(|a| a.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>, CoreError> {
        Ok(self.tables.lock().await.payments.get(&id).cloned())
    }

    async fn put_payment(&self, payment: Payment) -> Result<(), CoreError> {
        self.tables.lock().await.payments.insert(payment.id, payment);
        Ok(())
    }

    async fn delete_payment(&self, id: Uuid) -> Result<(), CoreError> {
        self.tables.lock().await.payments.remove(&id);
        Ok(())
    }

    async fn list_payments(&self, owner: Uuid) -> Result<Vec<Payment>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .payments
            .values()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect())
    }

    async fn list_stale_draft_invoices(&self, older_than_ms: i64) -> Result<Vec<Invoice>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .invoices
            .values()
            .filter(|i| i.is_draft && i.created_at.as_i64() < older_than_ms)
            .cloned()
            .collect())
    }

    async fn list_stale_draft_payments(&self, older_than_ms: i64) -> Result<Vec<Payment>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .payments
            .values()
            .filter(|p| p.is_draft && p.created_at.as_i64() < older_than_ms)
            .cloned()
            .collect())
    }

    async fn find_payment_by_hash(
        &self,
        owner: Uuid,
        sha256: &str,
        exclude: Option<Uuid>,
    ) -> Result<Option<Payment>, CoreError> {
        let tables = self.tables.lock().await;
        let mut matches: Vec<&Payment> = tables
            .payments
            .values()
            .filter(|p| {
                p.owner == owner
                    && p.file_sha256.as_deref() == Some(sha256)
                    && Some(p.id) != exclude
            })
            .collect();
        matches.sort_by_key(|p| p.is_draft);
        Ok(matches.first().map(|p| (*p).clone()))
    }

    async fn find_payments_by_amount_and_time(
        &self,
        owner: Uuid,
        amount: f64,
        ts_ms: i64,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Payment>, CoreError> {
        const AMOUNT_EPSILON: f64 = 0.01;
        const TIME_WINDOW_MS: i64 = 5 * 60 * 1000;
        Ok(self
            .tables
            .lock()
            .await
            .payments
            .values()
            .filter(|p| {
                p.owner == owner
                    && !p.is_draft
                    && Some(p.id) != exclude
                    && (p.amount - amount).abs() <= AMOUNT_EPSILON
                    && p.transaction_time_ts
                        .map(|ts| (ts.as_i64() - ts_ms).abs() <= TIME_WINDOW_MS)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn link_invoice_payment(&self, link: InvoicePaymentLink) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.links.contains(&link) {
            tables.links.push(link);
        }
        Ok(())
    }

    async fn unlink_invoice_payment(&self, link: InvoicePaymentLink) -> Result<(), CoreError> {
        self.tables.lock().await.links.retain(|l| *l != link);
        Ok(())
    }

    async fn links_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<InvoicePaymentLink>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .links
            .iter()
            .filter(|l| l.invoice_id == invoice_id)
            .copied()
            .collect())
    }

    async fn links_for_payment(&self, payment_id: Uuid) -> Result<Vec<InvoicePaymentLink>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .links
            .iter()
            .filter(|l| l.payment_id == payment_id)
            .copied()
            .collect())
    }

    async fn get_trip(&self, id: Uuid) -> Result<Option<Trip>, CoreError> {
        Ok(self.tables.lock().await.trips.get(&id).cloned())
    }

    async fn put_trip(&self, trip: Trip) -> Result<(), CoreError> {
        trip.validate()?;
        self.tables.lock().await.trips.insert(trip.id, trip);
        Ok(())
    }

    async fn delete_trip(&self, id: Uuid) -> Result<(), CoreError> {
        self.tables.lock().await.trips.remove(&id);
        Ok(())
    }

    async fn list_trips(&self, owner: Uuid) -> Result<Vec<Trip>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .trips
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, CoreError> {
        Ok(self.tables.lock().await.tasks.get(&id).cloned())
    }

    async fn put_task(&self, task: Task) -> Result<(), CoreError> {
        self.tables.lock().await.tasks.insert(task.id, task);
        Ok(())
    }

    async fn find_task_idempotent(
        &self,
        task_type: TaskType,
        created_by: Uuid,
        target_id: Uuid,
        file_sha256: Option<&str>,
    ) -> Result<Option<Task>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .tasks
            .values()
            .find(|t| {
                t.task_type == task_type
                    && t.created_by == created_by
                    && t.target_id == target_id
                    && t.file_sha256.as_deref() == file_sha256
                    && matches!(t.status, TaskStatus::Queued | TaskStatus::Processing)
            })
            .cloned())
    }

    async fn claim_next_queued_task(&self) -> Result<Option<Task>, CoreError> {
        let mut tables = self.tables.lock().await;
        let next_id = tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .min_by_key(|t| (t.created_at.as_i64(), t.id))
            .map(|t| t.id);
        let Some(id) = next_id else { return Ok(None) };
        let task = tables.tasks.get_mut(&id).expect("id came from this map");
        task.status = TaskStatus::Processing;
        Ok(Some(task.clone()))
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        expect: TaskStatus,
        set: TaskStatus,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        match tables.tasks.get_mut(&id) {
            Some(task) if task.status == expect => {
                task.status = set;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stuck_processing_tasks(&self, older_than_ms: i64) -> Result<Vec<Task>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing && t.updated_at.as_i64() < older_than_ms)
            .cloned()
            .collect())
    }

    async fn put_regression_sample(&self, sample: RegressionSample) -> Result<(), CoreError> {
        self.tables.lock().await.regression_samples.insert(sample.id, sample);
        Ok(())
    }

    async fn list_regression_samples(&self) -> Result<Vec<RegressionSample>, CoreError> {
        Ok(self.tables.lock().await.regression_samples.values().cloned().collect())
    }

    async fn delete_regression_sample(&self, id: Uuid) -> Result<(), CoreError> {
        self.tables.lock().await.regression_samples.remove(&id);
        Ok(())
    }

    async fn find_regression_sample_by_hash(
        &self,
        kind: RegressionKind,
        raw_hash: &str,
    ) -> Result<Option<RegressionSample>, CoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .regression_samples
            .values()
            .find(|s| s.kind == kind && s.raw_hash == raw_hash)
            .cloned())
    }
}
