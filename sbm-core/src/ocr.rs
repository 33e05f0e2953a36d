//! The OCR engine is an opaque "text-from-image/PDF" collaborator; only its
//! contract lives in this crate.

use async_trait::async_trait;

use sbm_common::error::CoreError;

/// What the OCR collaborator extracted, before field parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OcrResult {
    pub raw_text: String,
}

#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    async fn extract_text_from_pdf(&self, bytes: &[u8]) -> Result<OcrResult, CoreError>;
    async fn extract_text_from_image(&self, bytes: &[u8]) -> Result<OcrResult, CoreError>;
}

/// A fixed-response stand-in for tests and fixture replay; never reaches a
/// real OCR backend.
pub struct StubOcrEngine {
    pub fixed_text: String,
}

#[async_trait]
impl OcrEngine for StubOcrEngine {
    async fn extract_text_from_pdf(&self, _bytes: &[u8]) -> Result<OcrResult, CoreError> {
        Ok(OcrResult { raw_text: self.fixed_text.clone() })
    }

    async fn extract_text_from_image(&self, _bytes: &[u8]) -> Result<OcrResult, CoreError> {
        Ok(OcrResult { raw_text: self.fixed_text.clone() })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn stub_engine_returns_fixed_text() {
        let engine = StubOcrEngine { fixed_text: "hello".to_string() };
        let result = engine.extract_text_from_pdf(&[]).await.unwrap();
        assert_eq!(result.raw_text, "hello");
    }
}
