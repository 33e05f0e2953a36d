//! Field extraction over plain OCR'd invoice text, for PDFs with no
//! machine-readable XML sibling. Less precise than [`super::xml`]'s
//! tag-driven extraction since OCR text carries no structure, so this
//! leans on label/position heuristics over the raw string.

use once_cell::sync::Lazy;
use regex::Regex;

use super::xml::{normalize_date, parse_amount, ExtractedInvoiceData};

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\d,]+\.\d{1,2}").unwrap());
static INVOICE_NUMBER_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"发票号码[:：]?\s*(\d{8,20})").unwrap());
static INVOICE_NUMBER_BARE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{8,20})\b").unwrap());
static DATE_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(开票日期|日期)[:：]?\s*([0-9][0-9./年/-]{6,})").unwrap());

/// Extract what fields we can out of raw OCR text. Unlike the XML path,
/// totals come from [`extract_totals`]'s "largest number after 小写" rule
/// rather than a named element.
pub fn parse_invoice_text(text: &str) -> ExtractedInvoiceData {
    let mut data = ExtractedInvoiceData::default();

    data.invoice_number = INVOICE_NUMBER_LABEL_RE
        .captures(text)
        .map(|c| c[1].to_string())
        .or_else(|| INVOICE_NUMBER_BARE_RE.captures(text).map(|c| c[1].to_string()));

    data.issue_date = DATE_LABEL_RE
        .captures(text)
        .and_then(|c| normalize_date(&c[2]))
        .or_else(|| normalize_date(text));

    let (total, tax) = extract_totals(text);
    data.total_amount = total;
    data.tax_amount = tax;

    data
}

/// Totals-row heuristic: 发票 totals are printed as "…（大写）… （小写）<net>
/// <total> <tax>" — the largest monetary figure in the row is the
/// tax-inclusive total, and the tax is the last smaller figure in the row
/// (the net-of-tax amount comes first and is discarded).
pub fn extract_totals(text: &str) -> (Option<f64>, Option<f64>) {
    let window = match text.find("小写") {
        Some(idx) => &text[idx..],
        None => text,
    };
    let numbers: Vec<f64> = NUMBER_RE
        .find_iter(window)
        .take(6)
        .filter_map(|m| parse_amount(m.as_str()))
        .collect();
    if numbers.is_empty() {
        return (None, None);
    }
    let total = numbers.iter().cloned().fold(f64::MIN, f64::max);
    let tax = numbers.iter().cloned().filter(|&n| n < total).last();
    (Some(total), tax)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn totals_row_picks_max_as_total_and_last_smaller_as_tax() {
        let text = "价税合计（大写）捌拾捌圆整 （小写）83.01 88.00 4.99";
        assert_eq!(extract_totals(text), (Some(88.00), Some(4.99)));
    }

    #[test]
    fn no_small_writing_marker_falls_back_to_whole_text() {
        let text = "total due 6598.00 incl tax 759.06";
        assert_eq!(extract_totals(text), (Some(6598.00), Some(759.06)));
    }

    #[test]
    fn invoice_number_label_preferred_over_bare_digit_run() {
        let text = "发票号码：25317000003387982028 其他编号12345678";
        let data = parse_invoice_text(text);
        assert_eq!(data.invoice_number.as_deref(), Some("25317000003387982028"));
    }
}
