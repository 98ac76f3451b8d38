//! Embedding and extraction of provenance records in image containers.
//!
//! Two containers are supported:
//!
//! - JPEG: the record is JSON text in the EXIF `UserComment` field.
//! - PNG: the record is JSON text in a `Comment` text chunk.
//!
//! Records are additive metadata. The content payload (see
//! [`content_payload`]) covers everything except the carrier field, and
//! embedding leaves it unchanged.

mod exif;
mod jpeg;
mod png;

use std::borrow::Cow;

use serde::Serialize;
use tracing::debug;

use crate::error::CodecError;
use crate::record::ProvenanceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Detect the container from its leading magic bytes.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if jpeg::is_jpeg(data) {
            Some(Self::Jpeg)
        } else if png::is_png(data) {
            Some(Self::Png)
        } else {
            None
        }
    }
}

/// Outcome of looking for a provenance record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(ProvenanceRecord),
    /// The container has no comment field.
    NoMetadata,
    /// A comment field exists but does not hold a readable record, or the
    /// container structure around it is damaged.
    Malformed(String),
    UnsupportedFormat,
}

/// Return a copy of `image` carrying `record`.
pub fn embed(image: &[u8], record: &ProvenanceRecord) -> Result<Vec<u8>, CodecError> {
    let format = ImageFormat::detect(image).ok_or(CodecError::UnsupportedFormat)?;
    let json = record
        .to_json()
        .map_err(|e| CodecError::Serialize(e.to_string()))?;

    debug!(?format, bytes = json.len(), "embedding provenance record");
    match format {
        ImageFormat::Jpeg => jpeg::write_comment(image, json.as_bytes()),
        ImageFormat::Png => png::write_comment(image, &json),
    }
}

/// Read the provenance record embedded in `image`.
pub fn extract(image: &[u8]) -> Extraction {
    let Some(format) = ImageFormat::detect(image) else {
        return Extraction::UnsupportedFormat;
    };

    let comment: Result<Option<Cow<'_, str>>, CodecError> = match format {
        ImageFormat::Jpeg => {
            jpeg::read_comment(image).map(|c| c.map(|bytes| String::from_utf8_lossy(bytes)))
        }
        ImageFormat::Png => png::read_comment(image).map(|c| c.map(Into::into)),
    };

    match comment {
        Ok(Some(text)) if text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).is_empty() => {
            Extraction::NoMetadata
        }
        Ok(Some(text)) => match ProvenanceRecord::from_comment(&text) {
            Ok(record) => Extraction::Found(record),
            Err(reason) => Extraction::Malformed(reason),
        },
        Ok(None) => Extraction::NoMetadata,
        Err(e) => Extraction::Malformed(e.to_string()),
    }
}

/// Byte spans of `image` that the content digest covers.
///
/// - JPEG: every byte after SOI except the first Exif APP1 segment and a
///   final EOI. The Exif segment contributes a canonical listing of its
///   tags without UserComment and without offsets.
/// - PNG: every chunk after the signature except `Comment` text chunks,
///   followed by any bytes after IEND.
///
/// The digest is the same before and after [`embed`].
pub fn content_payload(image: &[u8]) -> Result<Vec<Cow<'_, [u8]>>, CodecError> {
    match ImageFormat::detect(image) {
        Some(ImageFormat::Jpeg) => jpeg::content_payload(image),
        Some(ImageFormat::Png) => png::content_payload(image),
        None => Err(CodecError::UnsupportedFormat),
    }
}
