//! A convenience module for hashing things with SHA-256. Used for
//! content-addressing IMAP attachments, ZIP member bodies, and OCR cache
//! entries.

/// SHA-256 digest a single input.
pub fn digest(input: &[u8]) -> ring::digest::Digest {
    digest_many(&[input])
}

/// SHA-256 digest several input slices concatenated together, without
/// allocating.
pub fn digest_many(inputs: &[&[u8]]) -> ring::digest::Digest {
    let mut ctx = context();
    for input in inputs {
        ctx.update(input);
    }
    ctx.finish()
}

/// Create a SHA-256 digest context for manually hashing e.g. large input files.
pub fn context() -> ring::digest::Context {
    ring::digest::Context::new(&ring::digest::SHA256)
}
