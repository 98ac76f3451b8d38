//! End-to-end verification of a provenance-carrying image.
//!
//! Verification runs as a linear sequence with early exit:
//!
//! 1. Extract the embedded record
//! 2. Hash the image's content payload
//! 3. Resolve the record's model identifier to a public key
//! 4. Check the signature against the recomputed digest
//!
//! Every problem with the image itself is reported as a
//! [`VerificationOutcome`]; only failing to read the input is an error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, info_span, warn};

use crate::digest::{digest_spans, ContentDigest};
use crate::error::Result;
use crate::metadata::{self, Extraction};
use crate::registry::{KeyRegistryClient, KeyResolution};
use crate::signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified,
    SignatureInvalid,
    KeyNotRegistered,
    NoMetadata,
    MalformedMetadata,
    RegistryUnavailable,
    UnsupportedFormat,
}

impl VerificationOutcome {
    pub fn is_verified(self) -> bool {
        self == Self::Verified
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Verified => "verified",
            Self::SignatureInvalid => "signature invalid",
            Self::KeyNotRegistered => "key not registered",
            Self::NoMetadata => "no provenance metadata",
            Self::MalformedMetadata => "malformed provenance metadata",
            Self::RegistryUnavailable => "registry unavailable",
            Self::UnsupportedFormat => "unsupported image format",
        };
        f.write_str(label)
    }
}

/// Result of verifying one image, suitable for audit logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub outcome: VerificationOutcome,
    /// Model identifier claimed by the embedded record.
    pub model_identifier: Option<String>,
    /// Digest recomputed from the image bytes.
    pub digest: Option<ContentDigest>,
    /// Whether the record's advisory digest equals the recomputed one.
    /// Diagnostic only.
    pub advisory_digest_match: Option<bool>,
    /// Why verification stopped, when it did not succeed.
    pub detail: Option<String>,
}

impl VerificationResult {
    fn terminal(outcome: VerificationOutcome, detail: Option<String>) -> Self {
        Self {
            outcome,
            model_identifier: None,
            digest: None,
            advisory_digest_match: None,
            detail,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.outcome.is_verified()
    }
}

/// Verifies images against a key registry.
///
/// Holds no per-call state; share one instance across threads to share
/// its registry cache.
#[derive(Debug)]
pub struct Verifier {
    keys: KeyRegistryClient,
}

impl Verifier {
    pub fn new(keys: KeyRegistryClient) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeyRegistryClient {
        &self.keys
    }

    pub fn verify_file(&self, path: &Path) -> Result<VerificationResult> {
        let image = std::fs::read(path)?;
        Ok(self.verify(&image))
    }

    pub fn verify(&self, image: &[u8]) -> VerificationResult {
        let span = info_span!("verify", bytes = image.len());
        let _guard = span.enter();

        let result = self.run(image);
        match result.outcome {
            VerificationOutcome::Verified => info!(
                model_identifier = result.model_identifier.as_deref(),
                digest = ?result.digest,
                "image verified"
            ),
            outcome => info!(
                %outcome,
                model_identifier = result.model_identifier.as_deref(),
                detail = result.detail.as_deref(),
                "image not verified"
            ),
        }
        result
    }

    fn run(&self, image: &[u8]) -> VerificationResult {
        // Extract
        let record = match metadata::extract(image) {
            Extraction::Found(record) => record,
            Extraction::NoMetadata => {
                return VerificationResult::terminal(VerificationOutcome::NoMetadata, None)
            }
            Extraction::Malformed(reason) => {
                return VerificationResult::terminal(
                    VerificationOutcome::MalformedMetadata,
                    Some(reason),
                )
            }
            Extraction::UnsupportedFormat => {
                return VerificationResult::terminal(VerificationOutcome::UnsupportedFormat, None)
            }
        };
        debug!(model_identifier = %record.model_identifier, "extracted provenance record");

        // Hash, independent of any digest in the record.
        let digest = match metadata::content_payload(image) {
            Ok(spans) => digest_spans(spans),
            Err(e) => {
                return VerificationResult::terminal(
                    VerificationOutcome::MalformedMetadata,
                    Some(e.to_string()),
                )
            }
        };
        let advisory_digest_match = record.advisory_digest_matches(&digest);
        if advisory_digest_match == Some(false) {
            warn!(
                claimed = record.digest_hex.as_deref(),
                actual = %digest,
                "embedded digest differs from recomputed digest"
            );
        }

        let mut result = VerificationResult {
            outcome: VerificationOutcome::SignatureInvalid,
            model_identifier: Some(record.model_identifier.clone()),
            digest: Some(digest),
            advisory_digest_match,
            detail: None,
        };

        // Resolve
        let public_key = match self.keys.resolve(&record.model_identifier) {
            KeyResolution::Key(key) => key,
            KeyResolution::NotRegistered => {
                result.outcome = VerificationOutcome::KeyNotRegistered;
                return result;
            }
            KeyResolution::Unavailable(reason) => {
                result.outcome = VerificationOutcome::RegistryUnavailable;
                result.detail = Some(reason);
                return result;
            }
        };

        // Verify
        if signature::verify(&public_key, &digest, &record.signature) {
            result.outcome = VerificationOutcome::Verified;
        } else {
            result.detail = Some("signature does not match content digest".to_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::digest::digest_bytes;
    use crate::record::ProvenanceRecord;
    use crate::registry::InMemoryRegistry;
    use crate::signature::DeviceKey;
    use std::sync::Arc;

    const MINIMAL_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xD9];

    fn verifier_with(registry: InMemoryRegistry) -> Verifier {
        Verifier::new(KeyRegistryClient::new(
            Arc::new(registry),
            RetryPolicy::none(),
        ))
    }

    fn signed_minimal_jpeg(key: &DeviceKey) -> Vec<u8> {
        let digest = digest_bytes(b"");
        let record = ProvenanceRecord::new("cam1", key.sign(&digest).unwrap()).with_digest(&digest);
        metadata::embed(MINIMAL_JPEG, &record).unwrap()
    }

    #[test]
    fn test_outcome_serialization() {
        let result = VerificationResult {
            outcome: VerificationOutcome::KeyNotRegistered,
            model_identifier: Some("cam1".to_string()),
            digest: Some(digest_bytes(b"")),
            advisory_digest_match: None,
            detail: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"outcome\":\"key_not_registered\""));
        assert!(json.contains("\"digest\":\"e3b0c442"));
    }

    #[test]
    fn test_verified_result_carries_audit_fields() {
        let key = DeviceKey::from_seed(&[7u8; 32]);
        let verifier =
            verifier_with(InMemoryRegistry::new().with_entry("cam1", key.public_key_bytes()));

        let result = verifier.verify(&signed_minimal_jpeg(&key));
        assert_eq!(result.outcome, VerificationOutcome::Verified);
        assert_eq!(result.model_identifier.as_deref(), Some("cam1"));
        assert_eq!(result.digest, Some(digest_bytes(b"")));
        assert_eq!(result.advisory_digest_match, Some(true));
        assert_eq!(result.detail, None);
    }

    #[test]
    fn test_no_metadata() {
        let verifier = verifier_with(InMemoryRegistry::new());
        let result = verifier.verify(MINIMAL_JPEG);
        assert_eq!(result.outcome, VerificationOutcome::NoMetadata);
        assert_eq!(result.model_identifier, None);
    }

    #[test]
    fn test_unsupported_format() {
        let verifier = verifier_with(InMemoryRegistry::new());
        assert_eq!(
            verifier.verify(b"GIF89a").outcome,
            VerificationOutcome::UnsupportedFormat
        );
    }

    #[test]
    fn test_wrong_key_is_signature_invalid() {
        let key = DeviceKey::from_seed(&[7u8; 32]);
        let other = DeviceKey::from_seed(&[8u8; 32]);
        let verifier =
            verifier_with(InMemoryRegistry::new().with_entry("cam1", other.public_key_bytes()));
        let result = verifier.verify(&signed_minimal_jpeg(&key));
        assert_eq!(result.outcome, VerificationOutcome::SignatureInvalid);
    }

    #[test]
    fn test_advisory_digest_is_not_trusted() {
        let key = DeviceKey::from_seed(&[7u8; 32]);
        let forged_digest = digest_bytes(b"some other image");
        let record = ProvenanceRecord::new("cam1", key.sign(&forged_digest).unwrap())
            .with_digest(&forged_digest);
        let image = metadata::embed(MINIMAL_JPEG, &record).unwrap();

        let verifier =
            verifier_with(InMemoryRegistry::new().with_entry("cam1", key.public_key_bytes()));
        let result = verifier.verify(&image);
        assert_eq!(result.outcome, VerificationOutcome::SignatureInvalid);
        assert_eq!(result.advisory_digest_match, Some(false));
    }

    #[test]
    fn test_short_signature_is_signature_invalid() {
        let key = DeviceKey::from_seed(&[7u8; 32]);
        let record = ProvenanceRecord::new("cam1", vec![1, 2, 3]);
        let image = metadata::embed(MINIMAL_JPEG, &record).unwrap();
        let verifier =
            verifier_with(InMemoryRegistry::new().with_entry("cam1", key.public_key_bytes()));
        assert_eq!(
            verifier.verify(&image).outcome,
            VerificationOutcome::SignatureInvalid
        );
    }

    #[test]
    fn test_verify_file_missing_is_error() {
        let verifier = verifier_with(InMemoryRegistry::new());
        assert!(verifier
            .verify_file(Path::new("/nonexistent/photo.jpg"))
            .is_err());
    }
}
