//! Binary wire primitives.
//!
//! PostgreSQL uses big-endian (network byte order) for all integers. This
//! module covers the fixed envelopes the driver core handles itself: signed
//! 32-bit length prefixes, per-field length+payload pairs, and the COPY
//! binary format framing. Malformed input surfaces as a [`Error::Data`]
//! carrying the offending byte offset.

use no_panic::no_panic;
use zerocopy::byteorder::big_endian;
use zerocopy::FromBytes;

use crate::error::{Error, Result};

/// Big-endian 16-bit signed integer.
pub type I16BE = big_endian::I16;
/// Big-endian 32-bit signed integer.
pub type I32BE = big_endian::I32;

/// A field length of `-1` on the wire encodes SQL NULL.
const NULL_LENGTH: i32 = -1;

/// Pack a signed 32-bit length prefix.
#[inline]
#[cfg_attr(not(debug_assertions), no_panic)]
pub fn pack_length(n: i32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Unpack a signed 32-bit length prefix at `offset`.
#[inline]
pub fn unpack_length(data: &[u8], offset: usize) -> Result<i32> {
    let bytes = offset
        .checked_add(4)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| {
            Error::Data(format!(
                "truncated length prefix at byte offset {offset}: {} byte(s) available",
                data.len().saturating_sub(offset)
            ))
        })?;
    let value = I32BE::ref_from_bytes(bytes)
        .map_err(|e| Error::Data(format!("length prefix at byte offset {offset}: {e:?}")))?;
    Ok(value.get())
}

/// Append one field as a length+payload pair (`None` encodes SQL NULL).
pub fn push_field(out: &mut Vec<u8>, field: Option<&[u8]>) {
    match field {
        Some(bytes) => {
            out.extend_from_slice(&pack_length(bytes.len() as i32));
            out.extend_from_slice(bytes);
        }
        None => out.extend_from_slice(&pack_length(NULL_LENGTH)),
    }
}

/// COPY binary format signature, required before all rows.
pub const COPY_SIGNATURE: [u8; 11] = *b"PGCOPY\n\xff\r\n\0";

/// Write the COPY binary header: signature, zero flags, zero extension length.
pub fn write_copy_header(out: &mut Vec<u8>) {
    out.extend_from_slice(&COPY_SIGNATURE);
    out.extend_from_slice(&pack_length(0)); // flags
    out.extend_from_slice(&pack_length(0)); // header extension length
}

/// Write the COPY binary trailer: a two-byte `-1` tuple marker.
pub fn write_copy_trailer(out: &mut Vec<u8>) {
    out.extend_from_slice(&(-1i16).to_be_bytes());
}

/// Append one COPY binary tuple: field count, then length+payload per field.
pub fn write_copy_row(out: &mut Vec<u8>, fields: &[Option<&[u8]>]) {
    out.extend_from_slice(&(fields.len() as i16).to_be_bytes());
    for field in fields {
        push_field(out, *field);
    }
}

/// Iterator over tuples of a COPY binary stream.
///
/// Checks the signature and header once, then yields one `Vec` of optional
/// field slices per tuple until the `-1` end-of-data marker.
pub struct BinaryRows<'a> {
    data: &'a [u8],
    offset: usize,
    header_seen: bool,
    done: bool,
}

impl<'a> BinaryRows<'a> {
    /// Iterate the tuples of `data`, which must start with the COPY header.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            header_seen: false,
            done: false,
        }
    }

    fn malformed(&self, what: &str) -> Error {
        Error::Data(format!(
            "malformed COPY binary data: {what} at byte offset {}",
            self.offset
        ))
    }

    fn read_i16(&mut self) -> Result<i16> {
        let bytes = self
            .data
            .get(self.offset..self.offset + 2)
            .ok_or_else(|| self.malformed("truncated field count"))?;
        let value = I16BE::ref_from_bytes(bytes)
            .map_err(|e| Error::Data(format!("field count at byte {}: {e:?}", self.offset)))?
            .get();
        self.offset += 2;
        Ok(value)
    }

    fn check_header(&mut self) -> Result<()> {
        let sig = self
            .data
            .get(..COPY_SIGNATURE.len())
            .ok_or_else(|| self.malformed("truncated signature"))?;
        if sig != COPY_SIGNATURE {
            return Err(self.malformed("bad signature"));
        }
        self.offset = COPY_SIGNATURE.len();
        let flags = unpack_length(self.data, self.offset)?;
        // Bits 16-31 are critical format flags (e.g. OIDs included); we
        // support none of them.
        if flags as u32 & 0xffff_0000 != 0 {
            return Err(self.malformed("unsupported flag bits"));
        }
        self.offset += 4;
        let extension_len = unpack_length(self.data, self.offset)?;
        self.offset += 4;
        let skip = usize::try_from(extension_len)
            .map_err(|_| self.malformed("negative header extension length"))?;
        if self.data.len() < self.offset + skip {
            return Err(self.malformed("truncated header extension"));
        }
        self.offset += skip;
        self.header_seen = true;
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Option<&'a [u8]>>>> {
        if !self.header_seen {
            self.check_header()?;
        }
        let field_count = self.read_i16()?;
        if field_count < 0 {
            self.done = true;
            return Ok(None);
        }
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let len = unpack_length(self.data, self.offset)?;
            self.offset += 4;
            if len == NULL_LENGTH {
                fields.push(None);
                continue;
            }
            let len = usize::try_from(len).map_err(|_| self.malformed("negative field length"))?;
            let payload = self
                .data
                .get(self.offset..self.offset + len)
                .ok_or_else(|| self.malformed("truncated field payload"))?;
            self.offset += len;
            fields.push(Some(payload));
        }
        Ok(Some(fields))
    }
}

impl<'a> Iterator for BinaryRows<'a> {
    type Item = Result<Vec<Option<&'a [u8]>>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Append one row in the COPY text format: tab-separated fields with
/// backslash escapes, `\N` for SQL NULL, newline-terminated.
pub fn write_copy_text_row(out: &mut Vec<u8>, fields: &[Option<&[u8]>]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        match field {
            None => out.extend_from_slice(b"\\N"),
            Some(value) => {
                for &byte in *value {
                    match byte {
                        b'\t' => out.extend_from_slice(b"\\t"),
                        b'\n' => out.extend_from_slice(b"\\n"),
                        b'\r' => out.extend_from_slice(b"\\r"),
                        b'\\' => out.extend_from_slice(b"\\\\"),
                        other => out.push(other),
                    }
                }
            }
        }
    }
    out.push(b'\n');
}

/// Parse one COPY text format line (without its trailing newline) into
/// unescaped fields, `None` for SQL NULL.
pub fn parse_copy_text_row(line: &[u8]) -> Result<Vec<Option<String>>> {
    let mut fields = Vec::new();
    let mut current = Vec::new();
    let mut bytes = line.iter().copied();
    let mut null = false;
    while let Some(byte) = bytes.next() {
        match byte {
            b'\t' => {
                fields.push(take_text_field(&mut current, &mut null)?);
            }
            b'\\' => match bytes.next() {
                Some(b't') => current.push(b'\t'),
                Some(b'n') => current.push(b'\n'),
                Some(b'r') => current.push(b'\r'),
                Some(b'\\') => current.push(b'\\'),
                Some(b'N') => null = true,
                other => {
                    return Err(Error::Data(format!(
                        "bad escape in COPY text data: {other:?}"
                    )))
                }
            },
            other => current.push(other),
        }
    }
    fields.push(take_text_field(&mut current, &mut null)?);
    Ok(fields)
}

fn take_text_field(current: &mut Vec<u8>, null: &mut bool) -> Result<Option<String>> {
    let bytes = core::mem::take(current);
    if core::mem::take(null) {
        if bytes.is_empty() {
            return Ok(None);
        }
        return Err(Error::Data("stray NULL marker in COPY text data".into()));
    }
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| Error::Data("COPY text data is not valid UTF-8".into()))
}
