//! JPEG container support: EXIF UserComment inside an APP1 segment.

use std::borrow::Cow;

use super::exif::{self, Tiff};
use crate::error::CodecError;

const CONTAINER: &str = "JPEG";

const MARKER_PREFIX: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const APP0: u8 = 0xE0;
const APP1: u8 = 0xE1;
const TEM: u8 = 0x01;
const RST0: u8 = 0xD0;
const RST7: u8 = 0xD7;

const EXIF_HEADER: &[u8] = b"Exif\0\0";
/// Largest segment body that fits the 16-bit length field.
const MAX_SEGMENT_BODY: usize = 0xFFFF - 2;

#[derive(Debug, Clone, Copy)]
struct Segment<'a> {
    /// Offset of the first 0xFF, fill bytes included.
    start: usize,
    end: usize,
    marker: u8,
    body: &'a [u8],
}

impl Segment<'_> {
    fn is_exif(&self) -> bool {
        self.marker == APP1 && self.body.starts_with(EXIF_HEADER)
    }
}

#[derive(Debug)]
struct Layout<'a> {
    /// Marker segments between SOI and the first SOS (or EOI).
    segments: Vec<Segment<'a>>,
    /// Offset where header walking stopped: the SOS or EOI marker.
    header_end: usize,
}

pub(crate) fn is_jpeg(data: &[u8]) -> bool {
    data.starts_with(&[MARKER_PREFIX, SOI, MARKER_PREFIX])
}

fn truncated(offset: usize) -> CodecError {
    CodecError::Truncated {
        container: CONTAINER,
        offset,
    }
}

fn invalid(reason: impl Into<String>) -> CodecError {
    CodecError::InvalidStructure {
        container: CONTAINER,
        reason: reason.into(),
    }
}

fn parse_layout(data: &[u8]) -> Result<Layout<'_>, CodecError> {
    if data.len() < 2 || data[0] != MARKER_PREFIX || data[1] != SOI {
        return Err(invalid("missing SOI marker"));
    }

    let mut segments = Vec::new();
    let mut pos = 2;

    loop {
        let start = pos;
        if pos >= data.len() {
            return Err(truncated(pos));
        }
        if data[pos] != MARKER_PREFIX {
            return Err(invalid(format!(
                "expected marker at offset {}, found 0x{:02x}",
                pos, data[pos]
            )));
        }
        while pos < data.len() && data[pos] == MARKER_PREFIX {
            pos += 1;
        }
        let marker = *data.get(pos).ok_or_else(|| truncated(pos))?;
        pos += 1;

        match marker {
            SOS | EOI => {
                return Ok(Layout {
                    segments,
                    header_end: start,
                })
            }
            TEM | RST0..=RST7 => {
                segments.push(Segment {
                    start,
                    end: pos,
                    marker,
                    body: &[],
                });
            }
            _ => {
                let len_bytes = data.get(pos..pos + 2).ok_or_else(|| truncated(pos))?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                if len < 2 {
                    return Err(invalid(format!("segment length {} at offset {}", len, pos)));
                }
                let end = pos + len;
                let body = data.get(pos + 2..end).ok_or_else(|| truncated(pos))?;
                segments.push(Segment {
                    start,
                    end,
                    marker,
                    body,
                });
                pos = end;
            }
        }
    }
}

impl<'a> Layout<'a> {
    /// The Exif segment that carries the record: the first one in the file.
    fn carrier(&self) -> Option<&Segment<'a>> {
        self.segments.iter().find(|s| s.is_exif())
    }
}

fn carrier_tiff<'a>(segment: &Segment<'a>) -> &'a [u8] {
    &segment.body[EXIF_HEADER.len()..]
}

/// Byte spans covered by the content digest.
///
/// Everything after SOI is covered except the carrier segment, which
/// contributes its canonical tag listing instead, and a final EOI marker.
pub(crate) fn content_payload(data: &[u8]) -> Result<Vec<Cow<'_, [u8]>>, CodecError> {
    let layout = parse_layout(data)?;
    let carrier = layout.carrier().map(|s| s.start);

    let mut spans = Vec::with_capacity(layout.segments.len() + 1);
    for segment in &layout.segments {
        if Some(segment.start) == carrier {
            let tags = Tiff::parse(carrier_tiff(segment))?.canonical_tags()?;
            if !tags.is_empty() {
                spans.push(Cow::Owned(tags));
            }
        } else {
            spans.push(Cow::Borrowed(&data[segment.start..segment.end]));
        }
    }

    let mut tail = &data[layout.header_end..];
    if tail.ends_with(&[MARKER_PREFIX, EOI]) {
        tail = &tail[..tail.len() - 2];
    }
    if !tail.is_empty() {
        spans.push(Cow::Borrowed(tail));
    }

    Ok(spans)
}

/// Raw UserComment bytes, or `None` when the image carries no comment.
pub(crate) fn read_comment(data: &[u8]) -> Result<Option<&[u8]>, CodecError> {
    let layout = parse_layout(data)?;
    match layout.carrier() {
        Some(segment) => Tiff::parse(carrier_tiff(segment))?.user_comment(),
        None => Ok(None),
    }
}

/// Rewrite the image with `comment` as the carrier's UserComment.
///
/// An existing carrier is updated in place with its other tags kept.
/// Otherwise a new segment goes after any leading APP0, since JFIF
/// requires APP0 to directly follow SOI.
pub(crate) fn write_comment(data: &[u8], comment: &[u8]) -> Result<Vec<u8>, CodecError> {
    let layout = parse_layout(data)?;
    let carrier = layout.carrier();
    let tiff = exif::set_user_comment(carrier.map(carrier_tiff), comment)?;
    let segment = exif_segment(&tiff)?;

    let (before, after) = match carrier {
        Some(carrier) => (carrier.start, carrier.end),
        None => {
            let at = layout
                .segments
                .iter()
                .take_while(|s| s.marker == APP0)
                .last()
                .map_or(2, |s| s.end);
            (at, at)
        }
    };

    let mut out = Vec::with_capacity(data.len() + segment.len());
    out.extend_from_slice(&data[..before]);
    out.extend_from_slice(&segment);
    out.extend_from_slice(&data[after..]);
    Ok(out)
}

fn exif_segment(tiff: &[u8]) -> Result<Vec<u8>, CodecError> {
    let body_len = EXIF_HEADER.len() + tiff.len();
    if body_len > MAX_SEGMENT_BODY {
        return Err(CodecError::RecordTooLarge {
            size: body_len,
            max: MAX_SEGMENT_BODY,
        });
    }

    let mut segment = Vec::with_capacity(4 + body_len);
    segment.extend_from_slice(&[MARKER_PREFIX, APP1]);
    segment.extend_from_slice(&((body_len + 2) as u16).to_be_bytes());
    segment.extend_from_slice(EXIF_HEADER);
    segment.extend_from_slice(tiff);
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::exif::tests::camera_tiff;

    const MINIMAL: &[u8] = &[0xFF, 0xD8, 0xFF, 0xD9];

    fn jfif_with_scan() -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        // APP0 JFIF
        data.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0x00]);
        // DQT (truncated table, structure only)
        data.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x04, 0x00, 0x01]);
        // COM
        data.extend_from_slice(&[0xFF, 0xFE, 0x00, 0x05, b'h', b'i', b'!']);
        // SOS header + entropy-coded data
        data.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x03, 0x01, 0x12, 0x34, 0xFF, 0x00, 0x56]);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    fn app1_exif(tiff: &[u8]) -> Vec<u8> {
        let mut segment = vec![0xFF, 0xE1];
        segment.extend_from_slice(&((tiff.len() + 8) as u16).to_be_bytes());
        segment.extend_from_slice(EXIF_HEADER);
        segment.extend_from_slice(tiff);
        segment
    }

    /// JFIF image whose Exif segment carries camera tags.
    fn camera_jpeg(orientation: u16) -> Vec<u8> {
        let scan = jfif_with_scan();
        let mut data = scan[..11].to_vec();
        data.extend(app1_exif(&camera_tiff(orientation)));
        data.extend_from_slice(&scan[11..]);
        data
    }

    fn payload(data: &[u8]) -> Vec<u8> {
        content_payload(data).unwrap().concat()
    }

    #[test]
    fn minimal_jpeg_has_empty_payload() {
        assert!(content_payload(MINIMAL).unwrap().is_empty());
    }

    #[test]
    fn payload_covers_all_but_soi_and_eoi() {
        let data = jfif_with_scan();
        assert_eq!(payload(&data), &data[2..data.len() - 2]);
    }

    #[test]
    fn payload_covers_rendering_segments() {
        let data = jfif_with_scan();

        // Adobe APP14 with colour transform 0.
        let mut adobe = data.clone();
        let app14 = [
            0xFF, 0xEE, 0x00, 0x0E, b'A', b'd', b'o', b'b', b'e', 0x00, 0x64, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        adobe.splice(11..11, app14);
        assert_ne!(payload(&adobe), payload(&data));

        // APP2 ICC profile fragment.
        let mut icc = data.clone();
        icc.splice(11..11, [0xFF, 0xE2, 0x00, 0x06, b'I', b'C', b'C', b'_']);
        assert_ne!(payload(&icc), payload(&data));

        // Bytes after EOI.
        let mut trailing = data.clone();
        trailing.extend_from_slice(b"extra");
        assert_ne!(payload(&trailing), payload(&data));
    }

    #[test]
    fn payload_covers_exif_orientation() {
        assert_ne!(payload(&camera_jpeg(1)), payload(&camera_jpeg(6)));
    }

    #[test]
    fn no_exif_means_no_comment() {
        assert_eq!(read_comment(&jfif_with_scan()).unwrap(), None);
        assert_eq!(read_comment(&camera_jpeg(1)).unwrap(), None);
    }

    #[test]
    fn write_then_read_comment() {
        let data = jfif_with_scan();
        let written = write_comment(&data, b"{\"a\":1}").unwrap();
        let comment = read_comment(&written).unwrap().unwrap();
        assert_eq!(&comment[..8], &[0u8; 8]);
        assert_eq!(&comment[8..], b"{\"a\":1}");
    }

    #[test]
    fn exif_follows_app0() {
        let written = write_comment(&jfif_with_scan(), b"{}").unwrap();
        assert_eq!(&written[2..4], &[0xFF, 0xE0]);
        assert_eq!(&written[11..13], &[0xFF, 0xE1]);
    }

    #[test]
    fn camera_tags_survive_write() {
        let data = camera_jpeg(6);
        let written = write_comment(&data, b"{\"a\":1}").unwrap();

        let layout = parse_layout(&written).unwrap();
        let carrier = layout.carrier().unwrap();
        assert_eq!(carrier.start, 11);
        let tiff = carrier_tiff(carrier);
        assert!(tiff.windows(6).any(|w| w == b"Nikon\0"));
        assert_eq!(
            Tiff::parse(tiff).unwrap().canonical_tags().unwrap(),
            Tiff::parse(&camera_tiff(6)).unwrap().canonical_tags().unwrap()
        );
        assert!(read_comment(&written).unwrap().unwrap().ends_with(b"{\"a\":1}"));
    }

    #[test]
    fn rewriting_replaces_existing_comment() {
        let once = write_comment(MINIMAL, b"{\"first\":1}").unwrap();
        let twice = write_comment(&once, b"{\"second\":2}").unwrap();
        let layout = parse_layout(&twice).unwrap();
        assert_eq!(layout.segments.iter().filter(|s| s.is_exif()).count(), 1);
        assert!(read_comment(&twice).unwrap().unwrap().ends_with(b"{\"second\":2}"));
    }

    #[test]
    fn only_first_exif_segment_is_carrier() {
        let mut data = camera_jpeg(1);
        let after_carrier = 11 + app1_exif(&camera_tiff(1)).len();
        let second = app1_exif(&camera_tiff(3));
        data.splice(after_carrier..after_carrier, second.clone());

        let written = write_comment(&data, b"{}").unwrap();
        assert!(written.windows(second.len()).any(|w| w == second.as_slice()));
        assert_eq!(payload(&written), payload(&data));
    }

    #[test]
    fn payload_unchanged_by_write() {
        for data in [MINIMAL.to_vec(), jfif_with_scan(), camera_jpeg(6)] {
            let once = write_comment(&data, b"{\"a\":1}").unwrap();
            let twice = write_comment(&once, b"{\"a\":22}").unwrap();
            assert_eq!(payload(&data), payload(&once));
            assert_eq!(payload(&data), payload(&twice));
        }
    }

    #[test]
    fn big_endian_exif_is_read() {
        let comment = b"\0\0\0\0\0\0\0\0{\"x\":1}";
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"MM\x00\x2A\x00\x00\x00\x08");
        tiff.extend_from_slice(&[0x00, 0x01, 0x87, 0x69, 0x00, 0x04, 0, 0, 0, 1, 0, 0, 0, 26]);
        tiff.extend_from_slice(&[0, 0, 0, 0]);
        tiff.extend_from_slice(&[0x00, 0x01, 0x92, 0x86, 0x00, 0x07, 0, 0, 0, comment.len() as u8]);
        tiff.extend_from_slice(&[0, 0, 0, 44, 0, 0, 0, 0]);
        tiff.extend_from_slice(comment);

        let mut data = vec![0xFF, 0xD8];
        data.extend(app1_exif(&tiff));
        data.extend_from_slice(&[0xFF, 0xD9]);

        assert_eq!(read_comment(&data).unwrap().unwrap(), comment);
    }

    #[test]
    fn truncated_segment_is_error() {
        let data = [0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x40, b'E'];
        assert!(matches!(
            read_comment(&data),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn garbled_tiff_is_error() {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x0C];
        data.extend_from_slice(EXIF_HEADER);
        data.extend_from_slice(b"XXXX");
        data.extend_from_slice(&[0xFF, 0xD9]);
        assert!(matches!(
            read_comment(&data),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(content_payload(&data).is_err());
        assert!(write_comment(&data, b"{}").is_err());
    }

    #[test]
    fn oversized_comment_rejected() {
        let comment = vec![b'a'; MAX_SEGMENT_BODY];
        assert!(matches!(
            write_comment(MINIMAL, &comment),
            Err(CodecError::RecordTooLarge { .. })
        ));
    }
}
