//! ZIP-wrapped invoice XML normalization, with a zip-bomb guard.

use std::io::Read;

/// Compression ratios above this are treated as a zip bomb and rejected.
const MAX_COMPRESSION_RATIO: u64 = 200;

/// Open `zip_bytes` as a ZIP archive, select `.xml` entries whose declared
/// uncompressed size fits `xml_byte_cap` and whose compression ratio is
/// within bounds, and return the largest one (ties broken by shorter name).
pub fn normalize_invoice_xml_bytes(zip_bytes: &[u8], xml_byte_cap: usize) -> Option<Vec<u8>> {
    let reader = std::io::Cursor::new(zip_bytes);
    let mut archive = zip::ZipArchive::new(reader).ok()?;

    let mut best_index: Option<usize> = None;
    let mut best_size: u64 = 0;
    let mut best_name_len = usize::MAX;

    for i in 0..archive.len() {
        let entry = archive.by_index(i).ok()?;
        if !entry.name().to_ascii_lowercase().ends_with(".xml") {
            continue;
        }
        let uncompressed = entry.size();
        let compressed = entry.compressed_size().max(1);
        if uncompressed > xml_byte_cap as u64 {
            continue;
        }
        if uncompressed / compressed > MAX_COMPRESSION_RATIO {
            continue;
        }
        let name_len = entry.name().len();
        let better = uncompressed > best_size
            || (uncompressed == best_size && name_len < best_name_len);
        if better {
            best_index = Some(i);
            best_size = uncompressed;
            best_name_len = name_len;
        }
    }

    let index = best_index?;
    let mut entry = archive.by_index(index).ok()?;
    let mut buf = Vec::with_capacity(best_size as usize);
    entry.by_ref().take(xml_byte_cap as u64).read_to_end(&mut buf).ok()?;
    Some(buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn picks_largest_xml_entry() {
        let zip = build_zip(&[
            ("small.xml", b"<a/>"),
            ("big.xml", b"<invoice><total>100</total></invoice>"),
            ("notes.txt", b"ignore me"),
        ]);
        let xml = normalize_invoice_xml_bytes(&zip, 5 * 1024 * 1024).unwrap();
        assert_eq!(xml, b"<invoice><total>100</total></invoice>");
    }

    #[test]
    fn rejects_entries_over_the_cap() {
        let zip = build_zip(&[("big.xml", &[b'a'; 100])]);
        assert!(normalize_invoice_xml_bytes(&zip, 10).is_none());
    }

    #[test]
    fn no_xml_entries_returns_none() {
        let zip = build_zip(&[("notes.txt", b"hello")]);
        assert!(normalize_invoice_xml_bytes(&zip, 1024).is_none());
    }
}
