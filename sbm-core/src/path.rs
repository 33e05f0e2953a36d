//! Uploads-relative path resolution and filename sanitization.
//!
//! Persisted file paths are always `uploads[/owner]/filename`, never
//! absolute, so that the entire blob area can be relocated by changing only
//! `uploads_dir`.

use uuid::Uuid;

/// Replace `/`, `\`, `..`, and spaces with `_` so a user-controlled filename
/// can't escape the owner's upload directory or collide via whitespace.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '/' | '\\' | ' ' => out.push('_'),
            '.' if chars.peek() == Some(&'.') => {
                out.push('_');
                out.push('_');
                chars.next();
            }
            _ => out.push(c),
        }
    }
    out
}

/// Build the uploads-relative storage path for a new file:
/// `<owner>/<ns>_<sanitized-name>`, where `ns` is a nanosecond timestamp
/// disambiguator.
pub fn new_storage_path(owner: Uuid, ns: u128, original_name: &str) -> String {
    format!("{owner}/{ns}_{}", sanitize_filename(original_name))
}

/// Resolve a stored (uploads-relative) path to an absolute path on disk.
pub fn resolve(uploads_dir: &str, stored_path: &str) -> std::path::PathBuf {
    std::path::Path::new(uploads_dir).join(stored_path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitizes_traversal_and_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "____etc_passwd");
        assert_eq!(sanitize_filename("my invoice.pdf"), "my_invoice.pdf");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("plain.pdf"), "plain.pdf");
    }

    #[test]
    fn storage_path_is_owner_scoped() {
        let owner = Uuid::nil();
        let path = new_storage_path(owner, 12345, "电子发票.pdf");
        assert!(path.starts_with(&format!("{owner}/12345_")));
    }
}
