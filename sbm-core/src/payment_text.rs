//! Field extraction over payment-screenshot OCR text: amount, merchant, and
//! (when a full date and time are both present) an RFC3339 transaction time.
//! Mirrors [`crate::invoice::text`]'s label/position heuristic approach.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static AMOUNT_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:金额|实付|合计)[:：]?\s*[¥￥]?\s*([\d,]+\.\d{1,2})").unwrap());
static AMOUNT_BARE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[¥￥]\s*([\d,]+\.\d{1,2})").unwrap());
static MERCHANT_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:商户|收款方|收款人)[:：]\s*([^\n\r]+)").unwrap());
static DATETIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})[-./年](\d{1,2})[-./月](\d{1,2})日?[ T](\d{1,2}):(\d{2})(?::(\d{2}))?").unwrap()
});

/// What screenshot OCR text yields before the caller decides whether a
/// confident transaction time was found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedPaymentData {
    pub amount: Option<f64>,
    pub merchant: Option<String>,
    /// RFC3339, only set when both a date and a time-of-day were found —
    /// a bare date is not enough to confirm a payment (§4.7 requires
    /// `transaction_time_ts`), so it's left `None` rather than guessed.
    pub transaction_time: Option<String>,
}

pub fn parse_payment_text(text: &str) -> ExtractedPaymentData {
    let amount = AMOUNT_LABEL_RE
        .captures(text)
        .or_else(|| AMOUNT_BARE_RE.captures(text))
        .and_then(|c| c[1].replace(',', "").parse::<f64>().ok());

    let merchant = MERCHANT_LABEL_RE.captures(text).map(|c| c[1].trim().to_string());

    let transaction_time = DATETIME_RE.captures(text).map(|c| {
        let (y, mo, d, h, mi) = (&c[1], &c[2], &c[3], &c[4], &c[5]);
        let s = c.get(6).map(|m| m.as_str()).unwrap_or("00");
        format!("{y}-{mo:0>2}-{d:0>2}T{h:0>2}:{mi:0>2}:{s:0>2}Z")
    });

    ExtractedPaymentData { amount, merchant, transaction_time }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_labeled_amount_and_merchant() {
        let text = "商户：星巴克咖啡\n金额：¥32.50\n2025-10-04 12:30:05 支付成功";
        let data = parse_payment_text(text);
        assert_eq!(data.amount, Some(32.50));
        assert_eq!(data.merchant.as_deref(), Some("星巴克咖啡"));
        assert_eq!(data.transaction_time.as_deref(), Some("2025-10-04T12:30:05Z"));
    }

    #[test]
    fn bare_date_with_no_time_of_day_yields_no_transaction_time() {
        let text = "2025年10月04日 消费记录 ¥18.00";
        let data = parse_payment_text(text);
        assert_eq!(data.amount, Some(18.00));
        assert_eq!(data.transaction_time, None);
    }
}
