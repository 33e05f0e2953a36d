//! Case-insensitive extraction of invoice fields out of normalized XML
//! bytes. Element names are matched locally-known (Chinese fapiao schema
//! plus the English OFD/UBL-ish variants seen from some providers), since no
//! schema registry is in scope.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use regex::Regex;
use serde::Serialize;

/// A single invoice line item, zipped from parallel name/spec/unit/quantity
/// arrays found in the XML.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineItem {
    pub name: String,
    pub spec: Option<String>,
    pub unit: Option<String>,
    pub quantity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedInvoiceData {
    pub invoice_number: Option<String>,
    pub issue_date: Option<String>,
    pub seller_name: Option<String>,
    pub buyer_name: Option<String>,
    pub total_amount: Option<f64>,
    pub tax_amount: Option<f64>,
    pub line_items: Vec<LineItem>,
}

/// Aliases for each logical field, matched case-insensitively against the
/// local (namespace-stripped) XML tag name.
static FIELD_ALIASES: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    HashMap::from([
        ("invoice_number", &["fphm"] as &[&str]),
        ("issue_date", &["kprq"] as &[&str]),
        ("seller_name", &["xfmc"] as &[&str]),
        ("buyer_name", &["gfmc"] as &[&str]),
        (
            "total_amount",
            &["jshj", "totaltax-includedamount", "totaltaxam"] as &[&str],
        ),
        ("tax_amount", &["hjse"] as &[&str]),
    ])
});

static ITEM_NAME_TAGS: &[&str] = &["spmc", "itemname"];
static ITEM_SPEC_TAGS: &[&str] = &["ggxh", "itemspec"];
static ITEM_UNIT_TAGS: &[&str] = &["dw", "itemunit"];
static ITEM_QTY_TAGS: &[&str] = &["sl", "itemquantity"];

static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})[-/年]?(\d{1,2})[-/月]?(\d{1,2})").unwrap());
static CURRENCY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d.\-]").unwrap());

/// Strip an XML namespace prefix (`ns:fphm` -> `fphm`) and lowercase.
fn local_name(tag: &str) -> String {
    tag.rsplit(':').next().unwrap_or(tag).to_ascii_lowercase()
}

fn field_for_tag(tag_lower: &str) -> Option<&'static str> {
    FIELD_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&tag_lower))
        .map(|(field, _)| *field)
}

/// Normalize a raw date string to `YYYY-MM-DD`.
pub fn normalize_date(raw: &str) -> Option<String> {
    let caps = DATE_RE.captures(raw.trim())?;
    let year = &caps[1];
    let month: u32 = caps[2].parse().ok()?;
    let day: u32 = caps[3].parse().ok()?;
    Some(format!("{year}-{month:02}-{day:02}"))
}

/// Strip currency marks (`¥`, `,`, `元`, whitespace) and parse as `f64`.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned = CURRENCY_RE.replace_all(raw.trim(), "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Parse normalized invoice XML bytes into structured fields.
pub fn parse_invoice_xml(xml: &[u8]) -> ExtractedInvoiceData {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut data = ExtractedInvoiceData::default();
    let mut buf = Vec::new();
    let mut current_field: Option<&'static str> = None;

    let mut item_names = Vec::new();
    let mut item_specs = Vec::new();
    let mut item_units = Vec::new();
    let mut item_qtys = Vec::new();
    let mut current_item_tag: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&String::from_utf8_lossy(e.name().as_ref()));
                current_field = field_for_tag(&name);
                current_item_tag = if ITEM_NAME_TAGS.contains(&name.as_str()) {
                    Some("name")
                } else if ITEM_SPEC_TAGS.contains(&name.as_str()) {
                    Some("spec")
                } else if ITEM_UNIT_TAGS.contains(&name.as_str()) {
                    Some("unit")
                } else if ITEM_QTY_TAGS.contains(&name.as_str()) {
                    Some("qty")
                } else {
                    None
                };
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                if let Some(field) = current_field {
                    assign_field(&mut data, field, &text);
                }
                match current_item_tag {
                    Some("name") => item_names.push(text),
                    Some("spec") => item_specs.push(text),
                    Some("unit") => item_units.push(text),
                    Some("qty") => item_qtys.push(text),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => {
                current_field = None;
                current_item_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    data.line_items = item_names
        .into_iter()
        .enumerate()
        .map(|(i, name)| LineItem {
            name,
            spec: item_specs.get(i).cloned(),
            unit: item_units.get(i).cloned(),
            quantity: item_qtys.get(i).cloned(),
        })
        .collect();

    data
}

fn assign_field(data: &mut ExtractedInvoiceData, field: &str, text: &str) {
    match field {
        "invoice_number" => data.invoice_number.get_or_insert_with(|| text.to_string()),
        "issue_date" => {
            let normalized = normalize_date(text).unwrap_or_else(|| text.to_string());
            data.issue_date.get_or_insert(normalized)
        }
        "seller_name" => data.seller_name.get_or_insert_with(|| text.to_string()),
        "buyer_name" => data.buyer_name.get_or_insert_with(|| text.to_string()),
        "total_amount" => {
            if data.total_amount.is_none() {
                if let Some(amount) = parse_amount(text) {
                    data.total_amount = Some(amount);
                }
            }
            return;
        }
        "tax_amount" => {
            if data.tax_amount.is_none() {
                if let Some(amount) = parse_amount(text) {
                    data.tax_amount = Some(amount);
                }
            }
            return;
        }
        _ => return,
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalizes_common_date_shapes() {
        assert_eq!(normalize_date("2024-03-05").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("2024年3月5日").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("2024/3/5").as_deref(), Some("2024-03-05"));
    }

    #[test]
    fn strips_currency_marks() {
        assert_eq!(parse_amount("¥1,234.56元"), Some(1234.56));
        assert_eq!(parse_amount("  88.00 "), Some(88.0));
    }

    #[test]
    fn parses_fields_and_line_items() {
        let xml = br#"<Invoice>
            <fphm>12345678</fphm>
            <kprq>2024-03-05</kprq>
            <xfmc>Seller Co</xfmc>
            <gfmc>Buyer Co</gfmc>
            <jshj>¥1,088.00</jshj>
            <hjse>88.00</hjse>
            <ItemList>
              <spmc>Widget</spmc><ggxh>A1</ggxh><dw>EA</dw><sl>2</sl>
              <spmc>Gadget</spmc><ggxh>B2</ggxh><dw>EA</dw><sl>1</sl>
            </ItemList>
        </Invoice>"#;
        let parsed = parse_invoice_xml(xml);
        assert_eq!(parsed.invoice_number.as_deref(), Some("12345678"));
        assert_eq!(parsed.issue_date.as_deref(), Some("2024-03-05"));
        assert_eq!(parsed.total_amount, Some(1088.0));
        assert_eq!(parsed.tax_amount, Some(88.0));
        assert_eq!(parsed.line_items.len(), 2);
        assert_eq!(parsed.line_items[0].name, "Widget");
        assert_eq!(parsed.line_items[1].name, "Gadget");
    }
}
