//! Capture-side signing: hash, sign, embed.

use std::path::Path;
use tracing::{debug, info};

use crate::digest::{digest_spans, ContentDigest};
use crate::error::Result;
use crate::metadata;
use crate::record::ProvenanceRecord;
use crate::registry::KeyRegistry;
use crate::signature::DeviceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Write the signed digest into the record for diagnostics.
    pub include_digest: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            include_digest: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignedImage {
    pub bytes: Vec<u8>,
    pub record: ProvenanceRecord,
    pub digest: ContentDigest,
}

/// Hash the content payload of `image`, sign it and embed the record.
pub fn sign_image(
    image: &[u8],
    model_identifier: &str,
    key: &DeviceKey,
    options: CaptureOptions,
) -> Result<SignedImage> {
    let digest = digest_spans(metadata::content_payload(image)?);
    debug!(model_identifier, %digest, "computed content digest");

    let mut record = ProvenanceRecord::new(model_identifier, key.sign(&digest)?);
    if options.include_digest {
        record = record.with_digest(&digest);
    }

    let bytes = metadata::embed(image, &record)?;
    Ok(SignedImage {
        bytes,
        record,
        digest,
    })
}

pub fn sign_image_file(
    input: &Path,
    output: &Path,
    model_identifier: &str,
    key: &DeviceKey,
    options: CaptureOptions,
) -> Result<SignedImage> {
    let image = std::fs::read(input)?;
    let signed = sign_image(&image, model_identifier, key, options)?;
    std::fs::write(output, &signed.bytes)?;
    info!(
        input = %input.display(),
        output = %output.display(),
        model_identifier,
        digest = %signed.digest,
        "signed image"
    );
    Ok(signed)
}

/// Publish the device's public key under `model_identifier`.
pub fn register_device(
    registry: &dyn KeyRegistry,
    model_identifier: &str,
    key: &DeviceKey,
) -> Result<()> {
    registry.publish_key(model_identifier, &key.public_key_bytes())?;
    info!(
        model_identifier,
        public_key = %hex::encode(key.public_key_bytes()),
        "registered device key"
    );
    Ok(())
}
