//! Depth-first walk of a RFC 5322 message, pulling out the primary invoice
//! PDF, any XML sidecar, extra PDFs, and the joined plain-text body.

use mail_parser::{Message, MessageParser, PartType};

use crate::zip_xml;

const PDF_BYTE_CAP: usize = 20 * 1024 * 1024;
const XML_BYTE_CAP: usize = 5 * 1024 * 1024;
const EML_BYTE_CAP: usize = 2 * 1024 * 1024;
const TEXT_FRAGMENT_CAP: usize = 512 * 1024;
const MAX_TEXT_FRAGMENTS: usize = 12;
const MAX_RECURSION_DEPTH: usize = 8;

#[derive(Debug, Default)]
pub struct ExtractedArtifacts {
    pub primary_pdf_filename: Option<String>,
    pub primary_pdf_bytes: Option<Vec<u8>>,
    pub xml_bytes: Option<Vec<u8>>,
    pub extra_pdfs: Vec<(String, Vec<u8>)>,
    pub body_text: String,
}

#[derive(Default)]
struct Collector {
    pdf_candidates: Vec<(String, Vec<u8>, i64)>,
    xml_bytes: Option<Vec<u8>>,
    text_fragments: Vec<String>,
}

impl Collector {
    fn finish(mut self) -> ExtractedArtifacts {
        self.pdf_candidates
            .sort_by(|a, b| b.2.cmp(&a.2));
        let mut iter = self.pdf_candidates.into_iter();
        let primary = iter.next();
        let extras = iter.map(|(name, bytes, _)| (name, bytes)).collect();
        ExtractedArtifacts {
            primary_pdf_filename: primary.as_ref().map(|(name, _, _)| name.clone()),
            primary_pdf_bytes: primary.map(|(_, bytes, _)| bytes),
            xml_bytes: self.xml_bytes,
            extra_pdfs: extras,
            body_text: self.text_fragments.join("\n"),
        }
    }

    fn push_text(&mut self, text: &str) {
        if self.text_fragments.len() >= MAX_TEXT_FRAGMENTS {
            return;
        }
        let truncated: String = text.chars().take(TEXT_FRAGMENT_CAP).collect();
        self.text_fragments.push(truncated);
    }
}

/// Parse `raw` as an email message and extract its invoice-relevant parts.
pub fn extract(raw: &[u8]) -> ExtractedArtifacts {
    let mut collector = Collector::default();
    walk_raw(raw, 0, &mut collector);
    collector.finish()
}

fn walk_raw(raw: &[u8], depth: usize, collector: &mut Collector) {
    if depth > MAX_RECURSION_DEPTH {
        return;
    }
    let Some(message) = MessageParser::default().parse(raw) else {
        return;
    };
    walk_message(&message, depth, collector);
}

fn walk_message(message: &Message, depth: usize, collector: &mut Collector) {
    for body in message.text_bodies() {
        if let Some(text) = body.text_contents() {
            collector.push_text(text);
        }
    }

    for part in message.attachments() {
        if let PartType::Message(nested) = &part.body {
            walk_message(nested, depth + 1, collector);
            continue;
        }

        let filename = part.attachment_name().map(str::to_string);
        let content_type = part
            .content_type()
            .map(|ct| format!("{}/{}", ct.ctype(), ct.subtype().unwrap_or_default()))
            .unwrap_or_default();
        let content_type_lower = content_type.to_ascii_lowercase();
        let filename_lower = filename.as_deref().unwrap_or_default().to_ascii_lowercase();
        let raw = part.contents();

        if filename_lower.ends_with(".eml") {
            if let Some(bytes) = capped(raw, EML_BYTE_CAP) {
                walk_raw(&bytes, depth + 1, collector);
            }
            continue;
        }

        let is_zip = filename_lower.ends_with(".zip") || content_type_lower.contains("zip");
        if is_zip {
            if let Some(xml) = zip_xml::normalize_invoice_xml_bytes(raw, XML_BYTE_CAP) {
                collector.xml_bytes.get_or_insert(xml);
            }
            continue;
        }

        let is_pdf = content_type_lower == "application/pdf"
            || filename_lower.ends_with(".pdf")
            || filename_lower.contains(".pdf?");
        if is_pdf {
            if let Some(bytes) = capped(raw, PDF_BYTE_CAP) {
                let name = filename.clone().unwrap_or_else(|| "attachment.pdf".to_string());
                let score = score_pdf_name(&name);
                collector.pdf_candidates.push((name, bytes, score));
            }
            continue;
        }

        let is_xml = content_type_lower.contains("xml") || filename_lower.ends_with(".xml");
        if is_xml {
            if collector.xml_bytes.is_none() {
                collector.xml_bytes = capped(raw, XML_BYTE_CAP);
            }
            continue;
        }

        if content_type_lower.starts_with("text/") || looks_like_text(raw) {
            if let Some(bytes) = capped(raw, TEXT_FRAGMENT_CAP) {
                if let Ok(text) = String::from_utf8(bytes) {
                    collector.push_text(&text);
                }
            }
        }
    }
}

fn capped(bytes: &[u8], cap: usize) -> Option<Vec<u8>> {
    if bytes.len() > cap {
        None
    } else {
        Some(bytes.to_vec())
    }
}

/// A byte buffer "looks like text" iff it has no NUL in the first 4 KiB and
/// fewer than 2% non-printable bytes (excluding tab/newline/CR). HTML markers
/// force text classification even if the ratio check would fail.
fn looks_like_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let head = &bytes[..bytes.len().min(4096)];
    if head.contains(&0) {
        return false;
    }
    let lower = String::from_utf8_lossy(head).to_ascii_lowercase();
    if lower.contains("<html") || lower.contains("<a ") || lower.contains("href=") {
        return true;
    }
    let non_printable = bytes
        .iter()
        .filter(|&&b| !(0x20..=0x7e).contains(&b) && b != b'\t' && b != b'\n' && b != b'\r')
        .count();
    (non_printable as f64) < (bytes.len() as f64) * 0.02
}

/// +40 for "电子发票", +25 for "发票", +1 for a `.pdf` suffix; itinerary
/// names score −80 (ride-hailing) or −20 (air/rail, still eligible).
fn score_pdf_name(name: &str) -> i64 {
    let mut score: i64 = 0;
    if name.contains("电子发票") {
        score += 40;
    }
    if name.contains("发票") {
        score += 25;
    }
    if name.to_ascii_lowercase().ends_with(".pdf") {
        score += 1;
    }
    if is_ride_hailing_itinerary(name) {
        score -= 80;
    } else if is_transit_itinerary(name) {
        score -= 20;
    }
    score
}

/// A ride-hailing trip table (滴滴/高德 行程单), never a standalone invoice —
/// these get attached to the best-matched invoice instead, per step 8 of the
/// parse pipeline.
pub fn is_ride_hailing_itinerary(name: &str) -> bool {
    name.contains("行程") && (name.contains("滴滴") || name.contains("高德"))
}

/// An air/rail itinerary name, still eligible for standalone invoice
/// creation (unlike a ride-hailing trip table).
pub fn is_transit_itinerary(name: &str) -> bool {
    ["航空", "机票", "air", "flight", "铁路", "高铁", "train", "rail"]
        .iter()
        .any(|kw| name.to_ascii_lowercase().contains(&kw.to_ascii_lowercase()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pdf_scoring_prefers_electronic_invoice_names() {
        assert!(score_pdf_name("2024电子发票.pdf") > score_pdf_name("random.pdf"));
    }

    #[test]
    fn ride_hailing_itinerary_scores_lowest() {
        let ride = score_pdf_name("滴滴出行行程单.pdf");
        let transit = score_pdf_name("国内航空行程单.pdf");
        let plain = score_pdf_name("invoice.pdf");
        assert!(ride < transit);
        assert!(transit < plain);
    }

    #[test]
    fn looks_like_text_detects_html_markers() {
        let html = b"<html><body><a href=\"x\">y</a></body></html>";
        assert!(looks_like_text(html));
    }

    #[test]
    fn looks_like_text_rejects_binary() {
        let binary: Vec<u8> = (0u8..=255).collect();
        assert!(!looks_like_text(&binary));
    }
}
