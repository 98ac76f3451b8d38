//! PNG container support: `Comment` text chunk.

use std::borrow::Cow;

use crate::error::CodecError;

const CONTAINER: &str = "PNG";

pub(crate) const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

const IEND: [u8; 4] = *b"IEND";
const TEXT: [u8; 4] = *b"tEXt";
const ITXT: [u8; 4] = *b"iTXt";
const ZTXT: [u8; 4] = *b"zTXt";

const COMMENT_KEYWORD: &[u8] = b"Comment";

#[derive(Debug, Clone, Copy)]
struct Chunk<'a> {
    start: usize,
    end: usize,
    kind: [u8; 4],
    data: &'a [u8],
    crc: u32,
}

impl Chunk<'_> {
    fn is_comment(&self) -> bool {
        matches!(self.kind, TEXT | ITXT | ZTXT) && keyword(self.data) == Some(COMMENT_KEYWORD)
    }

    fn crc_matches(&self) -> bool {
        chunk_crc(&self.kind, self.data) == self.crc
    }
}

fn keyword(data: &[u8]) -> Option<&[u8]> {
    data.iter().position(|&b| b == 0).map(|nul| &data[..nul])
}

fn chunk_crc(kind: &[u8; 4], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(data);
    hasher.finalize()
}

fn invalid(reason: impl Into<String>) -> CodecError {
    CodecError::InvalidStructure {
        container: CONTAINER,
        reason: reason.into(),
    }
}

pub(crate) fn is_png(data: &[u8]) -> bool {
    data.starts_with(&SIGNATURE)
}

/// Chunks up to and including IEND.
fn parse_chunks(data: &[u8]) -> Result<Vec<Chunk<'_>>, CodecError> {
    if !is_png(data) {
        return Err(invalid("missing PNG signature"));
    }

    let mut chunks = Vec::new();
    let mut pos = SIGNATURE.len();
    loop {
        let header = data.get(pos..pos + 8).ok_or(CodecError::Truncated {
            container: CONTAINER,
            offset: pos,
        })?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = [header[4], header[5], header[6], header[7]];
        if !kind.iter().all(u8::is_ascii_alphabetic) {
            return Err(invalid(format!("invalid chunk type at offset {}", pos)));
        }

        let data_start = pos + 8;
        let end = data_start
            .checked_add(len)
            .and_then(|e| e.checked_add(4))
            .filter(|&e| e <= data.len())
            .ok_or(CodecError::Truncated {
                container: CONTAINER,
                offset: pos,
            })?;
        let crc_bytes = &data[end - 4..end];

        chunks.push(Chunk {
            start: pos,
            end,
            kind,
            data: &data[data_start..end - 4],
            crc: u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]),
        });
        pos = end;

        if kind == IEND {
            return Ok(chunks);
        }
    }
}

/// Byte spans covered by the content digest: every chunk after the
/// signature except `Comment` text chunks, then any bytes after IEND.
pub(crate) fn content_payload(data: &[u8]) -> Result<Vec<Cow<'_, [u8]>>, CodecError> {
    let chunks = parse_chunks(data)?;
    let end = chunks.last().map_or(SIGNATURE.len(), |c| c.end);

    let mut spans: Vec<Cow<'_, [u8]>> = chunks
        .iter()
        .filter(|c| !c.is_comment())
        .map(|c| Cow::Borrowed(&data[c.start..c.end]))
        .collect();
    if end < data.len() {
        spans.push(Cow::Borrowed(&data[end..]));
    }
    Ok(spans)
}

/// Text of the first `Comment` chunk, or `None` when there is none.
pub(crate) fn read_comment(data: &[u8]) -> Result<Option<String>, CodecError> {
    let chunks = parse_chunks(data)?;
    let Some(chunk) = chunks.iter().find(|c| c.is_comment()) else {
        return Ok(None);
    };
    if !chunk.crc_matches() {
        return Err(invalid("Comment chunk CRC mismatch"));
    }

    let rest = &chunk.data[COMMENT_KEYWORD.len() + 1..];
    let text = match chunk.kind {
        // tEXt is Latin-1.
        TEXT => rest.iter().map(|&b| b as char).collect::<String>(),
        ITXT => decode_itxt(rest)?,
        _ => return Err(invalid("compressed Comment chunks are not supported")),
    };

    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

fn decode_itxt(rest: &[u8]) -> Result<String, CodecError> {
    let (&compression_flag, rest) = rest
        .split_first()
        .ok_or_else(|| invalid("truncated iTXt chunk"))?;
    if compression_flag != 0 {
        return Err(invalid("compressed Comment chunks are not supported"));
    }
    // Compression method, then language tag and translated keyword.
    let rest = rest.get(1..).ok_or_else(|| invalid("truncated iTXt chunk"))?;
    let mut fields = rest.splitn(3, |&b| b == 0);
    let (Some(_language), Some(_translated), Some(text)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(invalid("truncated iTXt chunk"));
    };
    Ok(String::from_utf8_lossy(text).into_owned())
}

fn encode_chunk(kind: [u8; 4], data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(data.len()).map_err(|_| CodecError::RecordTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&chunk_crc(&kind, data).to_be_bytes());
    Ok(out)
}

fn build_comment_chunk(text: &str) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::with_capacity(COMMENT_KEYWORD.len() + text.len() + 5);
    data.extend_from_slice(COMMENT_KEYWORD);
    data.push(0);
    if text.is_ascii() {
        data.extend_from_slice(text.as_bytes());
        encode_chunk(TEXT, &data)
    } else {
        // Uncompressed, no language tag, no translated keyword.
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(text.as_bytes());
        encode_chunk(ITXT, &data)
    }
}

/// Rewrite the image with a single `Comment` chunk placed before IEND.
pub(crate) fn write_comment(data: &[u8], text: &str) -> Result<Vec<u8>, CodecError> {
    let chunks = parse_chunks(data)?;
    let comment = build_comment_chunk(text)?;
    let end = chunks.last().map_or(SIGNATURE.len(), |c| c.end);

    let mut out = Vec::with_capacity(data.len() + comment.len());
    out.extend_from_slice(&SIGNATURE);
    for chunk in chunks.iter().filter(|c| !c.is_comment()) {
        if chunk.kind == IEND {
            out.extend_from_slice(&comment);
        }
        out.extend_from_slice(&data[chunk.start..chunk.end]);
    }
    out.extend_from_slice(&data[end..]);
    Ok(out)
}
