//! The data model entities shared by every component: users, mailbox
//! configs, invoices, payments, trips, background tasks, and the regression
//! fixture store. Kept as plain serde-friendly structs; persistence is the
//! [`crate::store::Store`] trait's concern, not this module's.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use sbm_common::time::TimestampMillis;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailConfig {
    pub id: Uuid,
    pub owner: Uuid,
    pub email: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub password: String,
    pub is_active: bool,
    pub last_check: Option<TimestampMillis>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailLogStatus {
    Received,
    Parsing,
    Parsed,
    Error,
    Deleted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailLog {
    pub id: Uuid,
    pub owner: Uuid,
    pub email_config_id: Uuid,
    pub mailbox: String,
    /// IMAP UID. 32-bit per RFC 3501.
    pub message_uid: u32,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub received_at: Option<TimestampMillis>,
    pub has_attachment: bool,
    pub attachment_count: u32,
    pub invoice_xml_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    pub status: EmailLogStatus,
    pub parse_error: Option<String>,
    pub parsed_invoice_id: Option<Uuid>,
    pub parsed_invoice_ids: Vec<Uuid>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    Ok,
    Suspected,
    Forced,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Parsing,
    Success,
    Failed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceSource {
    Upload,
    Email,
    Dingtalk,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub owner: Uuid,
    pub is_draft: bool,
    /// Legacy 1:1 mirror of the (at most one) linked payment.
    /// See DESIGN.md for the kept-as-is rationale.
    pub payment_id: Option<Uuid>,
    pub filename: String,
    pub original_name: String,
    /// Always uploads-root-relative.
    pub file_path: String,
    pub file_size: u64,
    pub file_sha256: Option<String>,
    pub invoice_number: Option<String>,
    /// `YYYY-MM-DD`.
    pub invoice_date: Option<String>,
    pub amount: Option<f64>,
    pub tax_amount: Option<f64>,
    pub seller_name: Option<String>,
    pub buyer_name: Option<String>,
    pub extracted_data: Json,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    pub raw_text: Option<String>,
    pub source: InvoiceSource,
    pub dedup_status: DedupStatus,
    pub dedup_ref_id: Option<Uuid>,
    pub bad_debt: bool,
    pub created_at: TimestampMillis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvoiceAttachment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub kind: String,
    pub filename: String,
    pub original_name: String,
    pub file_path: String,
    pub file_size: Option<u64>,
    pub file_sha256: Option<String>,
    pub source: InvoiceSource,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripAssignmentSource {
    Auto,
    Manual,
    Blocked,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripAssignmentState {
    Assigned,
    Overlap,
    NoMatch,
    Blocked,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub owner: Uuid,
    pub is_draft: bool,
    /// Non-negative; expenses stored positive.
    pub amount: f64,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub payment_method: Option<String>,
    pub description: Option<String>,
    /// RFC3339, UTC.
    pub transaction_time: Option<String>,
    pub transaction_time_ts: Option<TimestampMillis>,
    pub screenshot_path: Option<String>,
    pub file_sha256: Option<String>,
    pub extracted_data: Json,
    pub dedup_status: DedupStatus,
    pub dedup_ref_id: Option<Uuid>,
    pub trip_id: Option<Uuid>,
    pub trip_assignment_source: TripAssignmentSource,
    pub trip_assignment_state: TripAssignmentState,
    pub bad_debt: bool,
    pub created_at: TimestampMillis,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct InvoicePaymentLink {
    pub invoice_id: Uuid,
    pub payment_id: Uuid,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReimburseStatus {
    Unreimbursed,
    Reimbursed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trip {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub start_time: String,
    pub end_time: String,
    pub start_time_ts: TimestampMillis,
    pub end_time_ts: TimestampMillis,
    pub timezone: String,
    pub reimburse_status: ReimburseStatus,
    pub note: Option<String>,
}

/// Aggregated payment totals for one trip, as returned by `TripService::summary`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TripSummary {
    pub trip: Trip,
    pub payment_count: u32,
    pub total_amount: f64,
    pub bad_debt_amount: f64,
}

impl Trip {
    /// `end_time_ts > start_time_ts` is a hard invariant on construction.
    pub fn validate(&self) -> Result<(), sbm_common::error::CoreError> {
        if self.end_time_ts.as_i64() <= self.start_time_ts.as_i64() {
            return Err(sbm_common::error::CoreError::new(
                sbm_common::error::CoreErrorKind::ParseError,
                "trip end_time_ts must be greater than start_time_ts",
            ));
        }
        Ok(())
    }

    /// Half-open interval containment: `[start, end)`.
    pub fn contains(&self, ts: TimestampMillis) -> bool {
        self.start_time_ts.as_i64() <= ts.as_i64() && ts.as_i64() < self.end_time_ts.as_i64()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PaymentOcr,
    InvoiceOcr,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Once terminal, a task never transitions again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub created_by: Uuid,
    pub target_id: Uuid,
    pub file_sha256: Option<String>,
    pub result_json: Option<Json>,
    pub error: Option<String>,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionKind {
    PaymentScreenshot,
    Invoice,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionOrigin {
    Ui,
    Repo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegressionSample {
    pub id: Uuid,
    pub kind: RegressionKind,
    pub name: String,
    pub origin: RegressionOrigin,
    pub source_type: String,
    pub source_id: Uuid,
    pub raw_text: String,
    pub raw_hash: String,
    pub expected_json: Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Invite {
    pub id: Uuid,
    pub code_hash: String,
    pub code_hint: String,
    pub created_by: Uuid,
    pub used_at: Option<TimestampMillis>,
    pub used_by: Option<Uuid>,
    pub expires_at: Option<TimestampMillis>,
}
