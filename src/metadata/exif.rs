//! TIFF block handling for the Exif APP1 segment that carries the record.
//!
//! The record is the Exif IFD's UserComment. Writing it touches only that
//! entry and the IFDs that must grow to hold it. Everything else in an
//! existing block keeps its offset, so values referenced from elsewhere
//! (maker notes included) stay valid.

use std::ops::Range;

use crate::error::CodecError;

const TAG_EXIF_IFD_POINTER: u16 = 0x8769;
const TAG_GPS_IFD_POINTER: u16 = 0x8825;
const TAG_INTEROP_IFD_POINTER: u16 = 0xA005;
const TAG_USER_COMMENT: u16 = 0x9286;
const TAG_THUMBNAIL_OFFSET: u16 = 0x0201;
const TAG_THUMBNAIL_LENGTH: u16 = 0x0202;

const TYPE_BYTE: u16 = 1;
const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_UNDEFINED: u16 = 7;

const TIFF_HEADER_LEN: usize = 8;
const IFD_ENTRY_LEN: usize = 12;
const MAX_IFDS: usize = 32;

/// Markers for the IFD an entry came from in the canonical tag listing.
const KIND_EXIF: u8 = 0x01;
const KIND_GPS: u8 = 0x02;
const KIND_INTEROP: u8 = 0x03;
const KIND_CHAIN: u8 = 0x10;

/// Character code prefix for UserComment. All zeroes means "undefined";
/// the text that follows is written as UTF-8.
const UNDEFINED_CHARACTER_CODE: [u8; 8] = [0; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, data: &[u8], offset: usize) -> Option<u16> {
        let b: [u8; 2] = data.get(offset..offset.checked_add(2)?)?.try_into().ok()?;
        Some(match self {
            Self::Little => u16::from_le_bytes(b),
            Self::Big => u16::from_be_bytes(b),
        })
    }

    fn u32(self, data: &[u8], offset: usize) -> Option<u32> {
        let b: [u8; 4] = data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            Self::Little => u32::from_le_bytes(b),
            Self::Big => u32::from_be_bytes(b),
        })
    }

    fn encode_u16(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    fn encode_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

/// Size in bytes of one value of a TIFF field type.
fn type_size(field_type: u16) -> Option<usize> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8 => Some(2),
        4 | 9 | 11 | 13 => Some(4),
        5 | 10 | 12 => Some(8),
        _ => None,
    }
}

fn tiff_error(reason: &str) -> CodecError {
    CodecError::InvalidStructure {
        container: "JPEG",
        reason: format!("malformed EXIF: {}", reason),
    }
}

fn too_large(size: usize) -> CodecError {
    CodecError::RecordTooLarge {
        size,
        max: u32::MAX as usize,
    }
}

/// Append `bytes` at the next word boundary and return their offset.
fn append_aligned(out: &mut Vec<u8>, bytes: &[u8]) -> Result<u32, CodecError> {
    if out.len() % 2 != 0 {
        out.push(0);
    }
    let offset = u32::try_from(out.len()).map_err(|_| too_large(out.len()))?;
    out.extend_from_slice(bytes);
    Ok(offset)
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Offset of the 12-byte entry within the block.
    offset: usize,
    tag: u16,
    field_type: u16,
    count: u32,
}

#[derive(Debug)]
struct Ifd {
    entries: Vec<Entry>,
    next: u32,
}

impl Ifd {
    fn find(&self, tag: u16) -> Option<Entry> {
        self.entries.iter().find(|e| e.tag == tag).copied()
    }
}

/// A parsed view over a TIFF block.
#[derive(Debug)]
pub(crate) struct Tiff<'a> {
    data: &'a [u8],
    order: ByteOrder,
    ifd0: usize,
}

impl<'a> Tiff<'a> {
    pub(crate) fn parse(data: &'a [u8]) -> Result<Self, CodecError> {
        let order = match data.get(..2) {
            Some(b"II") => ByteOrder::Little,
            Some(b"MM") => ByteOrder::Big,
            _ => return Err(tiff_error("unknown byte order")),
        };
        if order.u16(data, 2) != Some(42) {
            return Err(tiff_error("bad TIFF magic"));
        }
        let ifd0 = order
            .u32(data, 4)
            .ok_or_else(|| tiff_error("missing IFD0 offset"))? as usize;
        if ifd0 < TIFF_HEADER_LEN {
            return Err(tiff_error("IFD0 offset inside header"));
        }
        Ok(Self { data, order, ifd0 })
    }

    fn ifd(&self, offset: usize) -> Result<Ifd, CodecError> {
        let count = self
            .order
            .u16(self.data, offset)
            .ok_or_else(|| tiff_error("IFD offset out of range"))? as usize;
        let entries_end = offset + 2 + count * IFD_ENTRY_LEN;
        if entries_end > self.data.len() {
            return Err(tiff_error("IFD entry out of range"));
        }

        let entries = (0..count)
            .map(|i| {
                let offset = offset + 2 + i * IFD_ENTRY_LEN;
                Entry {
                    offset,
                    tag: self.order.u16(self.data, offset).unwrap_or_default(),
                    field_type: self.order.u16(self.data, offset + 2).unwrap_or_default(),
                    count: self.order.u32(self.data, offset + 4).unwrap_or_default(),
                }
            })
            .collect();
        // Some writers drop the next-IFD field of the last IFD.
        let next = self.order.u32(self.data, entries_end).unwrap_or(0);
        Ok(Ifd { entries, next })
    }

    fn pointer(&self, entry: &Entry) -> Result<usize, CodecError> {
        let value = entry.offset + 8;
        match entry.field_type {
            TYPE_SHORT => self.order.u16(self.data, value).map(u32::from),
            _ => self.order.u32(self.data, value),
        }
        .map(|p| p as usize)
        .ok_or_else(|| tiff_error("bad IFD pointer"))
    }

    /// Location of an entry's value, inline or out of line.
    fn value_range(&self, entry: &Entry) -> Result<Range<usize>, CodecError> {
        let inline = entry.offset + 8;
        let Some(size) = type_size(entry.field_type) else {
            return Ok(inline..inline + 4);
        };
        let len = (entry.count as usize)
            .checked_mul(size)
            .ok_or_else(|| tiff_error("value length overflow"))?;
        let start = if len <= 4 {
            inline
        } else {
            self.order
                .u32(self.data, inline)
                .ok_or_else(|| tiff_error("bad value offset"))? as usize
        };
        start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .map(|end| start..end)
            .ok_or_else(|| tiff_error("value out of range"))
    }

    fn value(&self, entry: &Entry) -> Result<&'a [u8], CodecError> {
        let range = self.value_range(entry)?;
        Ok(&self.data[range])
    }

    fn exif_ifd(&self, ifd0: &Ifd) -> Result<Option<Ifd>, CodecError> {
        match ifd0.find(TAG_EXIF_IFD_POINTER) {
            Some(pointer) => Ok(Some(self.ifd(self.pointer(&pointer)?)?)),
            None => Ok(None),
        }
    }

    /// Raw UserComment value, character-code prefix included.
    pub(crate) fn user_comment(&self) -> Result<Option<&'a [u8]>, CodecError> {
        let ifd0 = self.ifd(self.ifd0)?;
        let Some(exif) = self.exif_ifd(&ifd0)? else {
            return Ok(None);
        };
        let Some(entry) = exif.find(TAG_USER_COMMENT) else {
            return Ok(None);
        };
        if !matches!(entry.field_type, TYPE_BYTE | TYPE_ASCII | TYPE_UNDEFINED) {
            return Err(tiff_error("unexpected UserComment type"));
        }
        let value = self.value(&entry)?;
        Ok((!value.is_empty()).then_some(value))
    }

    /// Every tag in the block except UserComment, as
    /// `kind | tag | type | count | value` records with big-endian headers.
    ///
    /// IFD pointers are followed rather than listed and thumbnail offsets
    /// are replaced by the thumbnail bytes, so no offset appears in the
    /// output. Writing a UserComment therefore leaves it unchanged.
    pub(crate) fn canonical_tags(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        let mut visited = Vec::new();
        let mut next = self.ifd0;
        let mut kind = KIND_CHAIN;
        while next != 0 {
            let ifd = self.visit(next, &mut visited)?;
            self.write_canonical(&ifd, kind, &mut out, &mut visited)?;
            next = ifd.next as usize;
            kind += 1;
        }
        Ok(out)
    }

    fn visit(&self, offset: usize, visited: &mut Vec<usize>) -> Result<Ifd, CodecError> {
        if visited.contains(&offset) {
            return Err(tiff_error("IFD loop"));
        }
        if visited.len() >= MAX_IFDS {
            return Err(tiff_error("too many IFDs"));
        }
        visited.push(offset);
        self.ifd(offset)
    }

    fn write_canonical(
        &self,
        ifd: &Ifd,
        kind: u8,
        out: &mut Vec<u8>,
        visited: &mut Vec<usize>,
    ) -> Result<(), CodecError> {
        for entry in &ifd.entries {
            let sub_kind = match entry.tag {
                TAG_EXIF_IFD_POINTER => Some(KIND_EXIF),
                TAG_GPS_IFD_POINTER => Some(KIND_GPS),
                TAG_INTEROP_IFD_POINTER => Some(KIND_INTEROP),
                _ => None,
            };
            if let Some(sub_kind) = sub_kind {
                let sub = self.visit(self.pointer(entry)?, visited)?;
                self.write_canonical(&sub, sub_kind, out, visited)?;
                continue;
            }
            if kind == KIND_EXIF && entry.tag == TAG_USER_COMMENT {
                continue;
            }

            let value = match entry.tag {
                TAG_THUMBNAIL_OFFSET => self.thumbnail(ifd, entry)?,
                _ => self.value(entry)?,
            };
            out.push(kind);
            out.extend_from_slice(&entry.tag.to_be_bytes());
            out.extend_from_slice(&entry.field_type.to_be_bytes());
            out.extend_from_slice(&entry.count.to_be_bytes());
            out.extend_from_slice(value);
        }
        Ok(())
    }

    fn thumbnail(&self, ifd: &Ifd, offset_entry: &Entry) -> Result<&'a [u8], CodecError> {
        let length = ifd
            .find(TAG_THUMBNAIL_LENGTH)
            .ok_or_else(|| tiff_error("thumbnail without length"))?;
        let start = self.pointer(offset_entry)?;
        let len = self.pointer(&length)?;
        start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| tiff_error("thumbnail out of range"))
    }

    fn encode_entry(&self, tag: u16, field_type: u16, count: u32, value: u32) -> [u8; IFD_ENTRY_LEN] {
        let mut entry = [0u8; IFD_ENTRY_LEN];
        entry[0..2].copy_from_slice(&self.order.encode_u16(tag));
        entry[2..4].copy_from_slice(&self.order.encode_u16(field_type));
        entry[4..8].copy_from_slice(&self.order.encode_u32(count));
        entry[8..12].copy_from_slice(&self.order.encode_u32(value));
        entry
    }

    /// Serialize `ifd` with one more entry, keeping tags in ascending order.
    fn ifd_with_entry(
        &self,
        ifd: &Ifd,
        tag: u16,
        entry: [u8; IFD_ENTRY_LEN],
    ) -> Result<Vec<u8>, CodecError> {
        let count = u16::try_from(ifd.entries.len() + 1)
            .map_err(|_| tiff_error("IFD has too many entries"))?;

        let mut out = Vec::with_capacity(2 + (count as usize) * IFD_ENTRY_LEN + 4);
        out.extend_from_slice(&self.order.encode_u16(count));
        let mut inserted = false;
        for existing in &ifd.entries {
            if !inserted && existing.tag > tag {
                out.extend_from_slice(&entry);
                inserted = true;
            }
            out.extend_from_slice(&self.data[existing.offset..existing.offset + IFD_ENTRY_LEN]);
        }
        if !inserted {
            out.extend_from_slice(&entry);
        }
        out.extend_from_slice(&self.order.encode_u32(ifd.next));
        Ok(out)
    }

    fn put_u16(&self, out: &mut [u8], offset: usize, value: u16) {
        out[offset..offset + 2].copy_from_slice(&self.order.encode_u16(value));
    }

    fn put_u32(&self, out: &mut [u8], offset: usize, value: u32) {
        out[offset..offset + 4].copy_from_slice(&self.order.encode_u32(value));
    }

    fn with_user_comment(&self, value: &[u8]) -> Result<Vec<u8>, CodecError> {
        let value_len = u32::try_from(value.len()).map_err(|_| too_large(value.len()))?;
        let mut out = self.data.to_vec();
        let ifd0 = self.ifd(self.ifd0)?;

        let Some(pointer) = ifd0.find(TAG_EXIF_IFD_POINTER) else {
            // No Exif IFD yet: add one, then relocate IFD0 with a pointer to it.
            let value_offset = append_aligned(&mut out, value)?;
            let mut exif = Vec::with_capacity(2 + IFD_ENTRY_LEN + 4);
            exif.extend_from_slice(&self.order.encode_u16(1));
            exif.extend_from_slice(&self.encode_entry(
                TAG_USER_COMMENT,
                TYPE_UNDEFINED,
                value_len,
                value_offset,
            ));
            exif.extend_from_slice(&self.order.encode_u32(0));
            let exif_offset = append_aligned(&mut out, &exif)?;

            let pointer = self.encode_entry(TAG_EXIF_IFD_POINTER, TYPE_LONG, 1, exif_offset);
            let relocated = self.ifd_with_entry(&ifd0, TAG_EXIF_IFD_POINTER, pointer)?;
            let ifd0_offset = append_aligned(&mut out, &relocated)?;
            self.put_u32(&mut out, 4, ifd0_offset);
            return Ok(out);
        };

        let exif = self.ifd(self.pointer(&pointer)?)?;
        match exif.find(TAG_USER_COMMENT) {
            Some(entry) => {
                // Reuse the old out-of-line slot when the new value fits.
                let reusable = self
                    .value_range(&entry)
                    .ok()
                    .filter(|r| r.start != entry.offset + 8 && value.len() <= r.len());
                let value_offset = match reusable {
                    Some(range) => {
                        out[range.clone()].fill(0);
                        out[range.start..range.start + value.len()].copy_from_slice(value);
                        range.start as u32
                    }
                    None => append_aligned(&mut out, value)?,
                };
                self.put_u16(&mut out, entry.offset + 2, TYPE_UNDEFINED);
                self.put_u32(&mut out, entry.offset + 4, value_len);
                self.put_u32(&mut out, entry.offset + 8, value_offset);
            }
            None => {
                let value_offset = append_aligned(&mut out, value)?;
                let comment =
                    self.encode_entry(TAG_USER_COMMENT, TYPE_UNDEFINED, value_len, value_offset);
                let relocated = self.ifd_with_entry(&exif, TAG_USER_COMMENT, comment)?;
                let exif_offset = append_aligned(&mut out, &relocated)?;

                self.put_u16(&mut out, pointer.offset + 2, TYPE_LONG);
                self.put_u32(&mut out, pointer.offset + 4, 1);
                self.put_u32(&mut out, pointer.offset + 8, exif_offset);
            }
        }
        Ok(out)
    }
}

/// Little-endian block holding only an Exif IFD with a UserComment.
fn new_block(value: &[u8]) -> Result<Vec<u8>, CodecError> {
    const IFD0_OFFSET: u32 = TIFF_HEADER_LEN as u32;
    const IFD_LEN: u32 = 2 + IFD_ENTRY_LEN as u32 + 4;
    const EXIF_IFD_OFFSET: u32 = IFD0_OFFSET + IFD_LEN;
    const DATA_OFFSET: u32 = EXIF_IFD_OFFSET + IFD_LEN;

    let value_len = u32::try_from(value.len()).map_err(|_| too_large(value.len()))?;
    let mut tiff = Vec::with_capacity(DATA_OFFSET as usize + value.len());
    tiff.extend_from_slice(b"II");
    tiff.extend_from_slice(&42u16.to_le_bytes());
    tiff.extend_from_slice(&IFD0_OFFSET.to_le_bytes());

    // IFD0: a single pointer to the Exif IFD.
    tiff.extend_from_slice(&1u16.to_le_bytes());
    tiff.extend_from_slice(&TAG_EXIF_IFD_POINTER.to_le_bytes());
    tiff.extend_from_slice(&TYPE_LONG.to_le_bytes());
    tiff.extend_from_slice(&1u32.to_le_bytes());
    tiff.extend_from_slice(&EXIF_IFD_OFFSET.to_le_bytes());
    tiff.extend_from_slice(&0u32.to_le_bytes());

    // Exif IFD: UserComment, always stored out of line.
    tiff.extend_from_slice(&1u16.to_le_bytes());
    tiff.extend_from_slice(&TAG_USER_COMMENT.to_le_bytes());
    tiff.extend_from_slice(&TYPE_UNDEFINED.to_le_bytes());
    tiff.extend_from_slice(&value_len.to_le_bytes());
    tiff.extend_from_slice(&DATA_OFFSET.to_le_bytes());
    tiff.extend_from_slice(&0u32.to_le_bytes());

    tiff.extend_from_slice(value);
    Ok(tiff)
}

/// Return a TIFF block whose UserComment holds `comment`.
///
/// With an existing block every other tag is kept. Without one a minimal
/// block is built.
pub(crate) fn set_user_comment(
    existing: Option<&[u8]>,
    comment: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let mut value = Vec::with_capacity(UNDEFINED_CHARACTER_CODE.len() + comment.len());
    value.extend_from_slice(&UNDEFINED_CHARACTER_CODE);
    value.extend_from_slice(comment);

    match existing {
        Some(data) => Tiff::parse(data)?.with_user_comment(&value),
        None => new_block(&value),
    }
}
