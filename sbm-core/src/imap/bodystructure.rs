//! Attachment counting from a message's MIME structure, independent of the
//! IMAP `BODYSTRUCTURE` wire encoding so it can run against both a live
//! session's parsed structure and a raw message fetched for parsing.

/// One MIME part's capability surface, narrowed to exactly what attachment
/// counting needs.
#[derive(Debug, Clone)]
pub struct PartInfo {
    pub content_type: String,
    pub is_attachment_disposition: bool,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub description: Option<String>,
    pub is_multipart_descendant: bool,
}

/// A part counts as an attachment iff: it has `Content-Disposition:
/// attachment`, a non-empty filename, and is not a `text/plain`/`text/html`
/// part lacking a filename; `application/pdf` and any XML content type
/// always count even without a filename; a non-text leaf part with a
/// `Content-Id` or `Description` also counts. A text part nested under
/// `multipart/alternative`/`multipart/related` is just another rendering of
/// the same body and never counts, even if it carries a stray filename.
pub fn is_attachment(part: &PartInfo) -> bool {
    let ct = part.content_type.to_ascii_lowercase();
    let has_filename = part.filename.as_deref().is_some_and(|f| !f.is_empty());
    let is_text_leaf = ct.starts_with("text/");

    if part.is_multipart_descendant && is_text_leaf {
        return false;
    }

    if part.is_attachment_disposition && has_filename {
        let is_plain_text_or_html = ct == "text/plain" || ct == "text/html";
        if !is_plain_text_or_html || has_filename {
            return true;
        }
    }
    if ct == "application/pdf" || ct.contains("xml") {
        return true;
    }
    if !is_text_leaf && (part.content_id.is_some() || part.description.is_some()) {
        return true;
    }
    false
}

/// Count attachments across a flattened part list (multipart descendants
/// already expanded by the caller).
pub fn count_attachments(parts: &[PartInfo]) -> u32 {
    parts.iter().filter(|p| is_attachment(p)).count() as u32
}

#[cfg(test)]
mod test {
    use super::*;

    fn part(content_type: &str, disposition: bool, filename: Option<&str>) -> PartInfo {
        PartInfo {
            content_type: content_type.to_string(),
            is_attachment_disposition: disposition,
            filename: filename.map(str::to_string),
            content_id: None,
            description: None,
            is_multipart_descendant: false,
        }
    }

    #[test]
    fn pdf_counts_even_without_filename() {
        let p = part("application/pdf", false, None);
        assert!(is_attachment(&p));
    }

    #[test]
    fn xml_counts_even_without_filename() {
        let p = part("application/xml", false, None);
        assert!(is_attachment(&p));
    }

    #[test]
    fn plain_text_without_filename_is_not_an_attachment() {
        let p = part("text/plain", false, None);
        assert!(!is_attachment(&p));
    }

    #[test]
    fn disposition_attachment_with_filename_counts() {
        let p = part("application/octet-stream", true, Some("invoice.pdf"));
        assert!(is_attachment(&p));
    }

    #[test]
    fn non_text_leaf_with_content_id_counts() {
        let mut p = part("image/png", false, None);
        p.content_id = Some("<logo>".to_string());
        assert!(is_attachment(&p));
    }

    #[test]
    fn multipart_alternative_html_rendering_is_not_an_attachment() {
        let mut p = part("text/html", true, Some("body.html"));
        p.is_multipart_descendant = true;
        assert!(!is_attachment(&p));
    }

    #[test]
    fn count_attachments_tallies_across_parts() {
        let parts = vec![
            part("application/pdf", false, None),
            part("text/plain", false, None),
            part("application/xml", false, None),
        ];
        assert_eq!(count_attachments(&parts), 2);
    }
}
