//! The universal length-prefixed record envelope used by every bag entity.
//!
//! A record is laid out as `hlen:u32 | header[hlen] | dlen:u32 | data[dlen]`,
//! all little-endian. The header is a sequence of `flen:u32 | name "=" value`
//! entries. Connection records reuse the same field encoding for their data
//! payload, so [`RecordFields::parse`] is shared between both layers.

use std::collections::HashMap;

use crate::error::{FormatError, Result};
use crate::time::BagTime;

fn read_u32(buffer: &[u8], offset: usize) -> Result<u32> {
    let bytes = buffer
        .get(offset..offset + 4)
        .ok_or(FormatError::TruncatedRecord {
            offset: offset as u64,
        })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn slice<'a>(buffer: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8]> {
    buffer
        .get(offset..offset + len)
        .ok_or(FormatError::TruncatedRecord {
            offset: offset as u64,
        })
}

/// The `name=value` fields of a record header, keyed by ASCII name.
///
/// Names are unique within a record and their order carries no meaning.
#[derive(Debug, Clone, Default)]
pub struct RecordFields {
    fields: HashMap<String, Vec<u8>>,
}

impl RecordFields {
    /// Parses a concatenation of `len:u32 | name "=" value` entries.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut fields = HashMap::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len = read_u32(bytes, offset)? as usize;
            offset += 4;
            let entry = slice(bytes, offset, len)?;
            let equals = entry
                .iter()
                .position(|&b| b == b'=')
                .ok_or(FormatError::MissingEquals)?;
            let name = String::from_utf8_lossy(&entry[..equals]).into_owned();
            fields.insert(name, entry[equals + 1..].to_vec());
            offset += len;
        }
        Ok(Self { fields })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn raw(&self, name: &'static str) -> Result<&[u8]> {
        self.fields
            .get(name)
            .map(Vec::as_slice)
            .ok_or(FormatError::MissingField(name))
    }

    pub fn u32(&self, name: &'static str) -> Result<u32> {
        let raw = self.raw(name)?;
        read_u32(raw, 0)
    }

    pub fn u64(&self, name: &'static str) -> Result<u64> {
        let raw = self.raw(name)?;
        let bytes: [u8; 8] = raw
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or(FormatError::TruncatedRecord { offset: 0 })?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn time(&self, name: &'static str) -> Result<BagTime> {
        let raw = self.raw(name)?;
        let bytes: [u8; 8] = raw
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or(FormatError::TruncatedRecord { offset: 0 })?;
        Ok(BagTime::from_le_bytes(bytes))
    }

    pub fn string(&self, name: &'static str) -> Result<String> {
        Ok(String::from_utf8_lossy(self.raw(name)?).into_owned())
    }

    /// Like [`RecordFields::string`] but absent fields read as empty.
    pub fn string_or_default(&self, name: &str) -> String {
        self.fields
            .get(name)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default()
    }
}

/// One record sliced out of a larger buffer, header parsed, data untouched.
///
/// `record_offset` and `data_offset` are positions in the logical file
/// coordinate space, not indices into the local buffer.
#[derive(Debug)]
pub struct ShallowRecord<'a> {
    pub record_offset: u64,
    pub record_length: usize,
    pub data_offset: u64,
    pub fields: RecordFields,
    pub data: &'a [u8],
}

impl<'a> ShallowRecord<'a> {
    /// Reads the record starting at `local_offset` in `buffer`, where the
    /// buffer itself begins at `base_offset` in the file.
    pub fn read(buffer: &'a [u8], base_offset: u64, local_offset: usize) -> Result<Self> {
        let header_len = read_u32(buffer, local_offset)? as usize;
        let header = slice(buffer, local_offset + 4, header_len)?;
        let fields = RecordFields::parse(header)?;
        let data_len_at = local_offset + 4 + header_len;
        let data_len = read_u32(buffer, data_len_at)? as usize;
        let data = slice(buffer, data_len_at + 4, data_len)?;
        Ok(Self {
            record_offset: base_offset + local_offset as u64,
            record_length: 4 + header_len + 4 + data_len,
            data_offset: base_offset + (data_len_at + 4) as u64,
            fields,
            data,
        })
    }
}

/// Parses `count` consecutive records, advancing by each record's length.
///
/// Returns the parsed values together with the total byte span consumed.
pub fn read_records<'a, T>(
    buffer: &'a [u8],
    count: usize,
    base_offset: u64,
    start: usize,
    mut parse: impl FnMut(ShallowRecord<'a>) -> Result<T>,
) -> Result<(Vec<T>, usize)> {
    let mut out = Vec::with_capacity(count);
    let mut offset = start;
    for _ in 0..count {
        let record = ShallowRecord::read(buffer, base_offset, offset)?;
        offset += record.record_length;
        out.push(parse(record)?);
    }
    Ok((out, offset - start))
}
