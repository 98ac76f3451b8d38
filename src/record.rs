//! Provenance record embedded in an image's comment field.

use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub model_identifier: String,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    /// Digest the device signed. Diagnostic only; verification always
    /// recomputes the digest from the image bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_hex: Option<String>,
}

impl ProvenanceRecord {
    pub fn new(model_identifier: impl Into<String>, signature: Vec<u8>) -> Self {
        Self {
            model_identifier: model_identifier.into(),
            signature,
            digest_hex: None,
        }
    }

    pub fn with_digest(mut self, digest: &ContentDigest) -> Self {
        self.digest_hex = Some(digest.to_hex());
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a record out of comment text.
    ///
    /// Only the span from the first `{` to the last `}` is parsed, so
    /// character-code prefixes and trailing padding are ignored.
    pub fn from_comment(text: &str) -> Result<Self, String> {
        let start = text.find('{');
        let end = text.rfind('}');
        let span = match (start, end) {
            (Some(start), Some(end)) if start < end => &text[start..=end],
            _ => return Err("comment contains no JSON object".to_string()),
        };

        serde_json::from_str(span).map_err(|e| format!("failed to parse record JSON: {}", e))
    }

    /// Compare the advisory digest against a recomputed one.
    ///
    /// Returns `None` when the record carries no digest.
    pub fn advisory_digest_matches(&self, actual: &ContentDigest) -> Option<bool> {
        self.digest_hex
            .as_deref()
            .map(|claimed| match ContentDigest::from_hex(claimed) {
                Ok(claimed) => claimed == *actual,
                Err(_) => false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;

    #[test]
    fn parse_plain_json() {
        let record =
            ProvenanceRecord::from_comment(r#"{"model_identifier":"cam1","signature":"abcd"}"#)
                .unwrap();
        assert_eq!(record.model_identifier, "cam1");
        assert_eq!(record.signature, vec![0xab, 0xcd]);
        assert_eq!(record.digest_hex, None);
    }

    #[test]
    fn parse_with_wrapper_bytes() {
        let text = "ASCII\0\0\0{\"model_identifier\":\"cam1\",\"signature\":\"00\"}\0\0 trailing";
        let record = ProvenanceRecord::from_comment(text).unwrap();
        assert_eq!(record.model_identifier, "cam1");
    }

    #[test]
    fn reject_missing_braces() {
        assert!(ProvenanceRecord::from_comment("no json here").is_err());
        assert!(ProvenanceRecord::from_comment("} reversed {").is_err());
    }

    #[test]
    fn reject_unbalanced_braces() {
        let result = ProvenanceRecord::from_comment(r#"{"model_identifier":"cam1"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn reject_non_hex_signature() {
        let result =
            ProvenanceRecord::from_comment(r#"{"model_identifier":"cam1","signature":"zz"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn serialize_omits_missing_digest() {
        let json = ProvenanceRecord::new("cam1", vec![1, 2]).to_json().unwrap();
        assert_eq!(json, r#"{"model_identifier":"cam1","signature":"0102"}"#);
    }

    #[test]
    fn advisory_digest_comparison() {
        let digest = digest_bytes(b"");
        let record = ProvenanceRecord::new("cam1", vec![]).with_digest(&digest);
        assert_eq!(record.advisory_digest_matches(&digest), Some(true));
        assert_eq!(
            record.advisory_digest_matches(&digest_bytes(b"x")),
            Some(false)
        );
        assert_eq!(
            ProvenanceRecord::new("cam1", vec![]).advisory_digest_matches(&digest),
            None
        );
    }
}
