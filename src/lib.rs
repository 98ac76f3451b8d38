//! Camera Provenance Library
//!
//! Signs photographs at capture time and verifies them later against a
//! public registry of device keys.

pub mod capture;
pub mod config;
pub mod digest;
pub mod error;
pub mod metadata;
pub mod record;
pub mod registry;
pub mod signature;
pub mod verify;

pub use capture::{register_device, sign_image, sign_image_file, CaptureOptions, SignedImage};
pub use config::{ProvenanceConfig, RegistryConfig, RetryPolicy};
pub use digest::{digest_bytes, digest_file, digest_reader, digest_spans, ContentDigest};
pub use error::{CodecError, ProvenanceError, RegistryCallError, Result};
pub use metadata::{content_payload, embed, extract, Extraction, ImageFormat};
pub use record::ProvenanceRecord;
pub use registry::{
    InMemoryRegistry, KeyRegistry, KeyRegistryClient, KeyResolution, RegistryDeployment,
    RpcRegistry, SENTINEL_KEY,
};
pub use signature::{sign_with_pem, DeviceKey, DigestInput};
pub use verify::{VerificationOutcome, VerificationResult, Verifier};
