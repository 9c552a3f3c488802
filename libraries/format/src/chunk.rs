//! Decodes one chunk's raw byte span into time-sorted messages.

use std::collections::HashMap;

use serde::Serialize;

use crate::compression::decompress;
use crate::decode::{decode_message, Value};
use crate::error::{FormatError, Result};
use crate::inspector::{ChunkInfo, Connection};
use crate::record::{read_records, ShallowRecord};
use crate::schema::SchemaCache;
use crate::time::BagTime;

/// One decoded message, tagged with its topic and record time.
#[derive(Debug, Clone, Serialize)]
pub struct RosbagMessage {
    pub topic: String,
    pub time: BagTime,
    pub data: Value,
}

/// A pointer into the decompressed chunk payload.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    received_time: BagTime,
    msg_data_offset: u32,
}

fn parse_index_data(record: ShallowRecord<'_>) -> Result<Vec<IndexEntry>> {
    let count = record.fields.u32("count")? as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let entry = record
            .data
            .get(i * 12..i * 12 + 12)
            .ok_or(FormatError::TruncatedRecord {
                offset: record.data_offset + (i * 12) as u64,
            })?;
        entries.push(IndexEntry {
            received_time: BagTime::from_le_bytes(entry[..8].try_into().expect("8-byte slice")),
            msg_data_offset: u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]),
        });
    }
    Ok(entries)
}

fn decode_one_message(
    payload: &[u8],
    entry: IndexEntry,
    connections: &HashMap<u32, Connection>,
    schemas: &mut SchemaCache,
) -> Result<Option<RosbagMessage>> {
    let record = ShallowRecord::read(payload, 0, entry.msg_data_offset as usize)?;
    let conn = record.fields.u32("conn")?;
    let Some(connection) = connections.get(&conn) else {
        // The index may reference connections filtered out of this file.
        return Ok(None);
    };
    let time = record.fields.time("time")?;
    let schema = schemas.get_or_compile(&connection.message_type, &connection.message_definition)?;
    let data = decode_message(&schema, record.data)?;
    Ok(Some(RosbagMessage {
        topic: connection.topic.clone(),
        time,
        data,
    }))
}

/// Decodes every message of one chunk.
///
/// `chunk_bytes` holds the raw on-disk span
/// `[chunk_position, next_chunk_position)`: the chunk record itself
/// followed by one index-data record per connection. Messages come out
/// sorted by received time. A message that fails to decode is logged and
/// skipped; only chunk-level problems (bad compression, broken index) fail
/// the whole call.
pub fn decode_chunk(
    info: &ChunkInfo,
    chunk_bytes: &[u8],
    connections: &HashMap<u32, Connection>,
    schemas: &mut SchemaCache,
) -> Result<Vec<RosbagMessage>> {
    let chunk_record = ShallowRecord::read(chunk_bytes, info.chunk_position, 0)?;
    let compression = chunk_record.fields.string("compression")?;
    let size = chunk_record.fields.u32("size")? as usize;
    let payload = decompress(&compression, chunk_record.data, size)?;

    let (per_conn_entries, _) = read_records(
        chunk_bytes,
        info.count as usize,
        info.chunk_position,
        chunk_record.record_length,
        parse_index_data,
    )?;
    let mut entries: Vec<IndexEntry> = per_conn_entries.into_iter().flatten().collect();
    entries.sort_by(|a, b| a.received_time.cmp(&b.received_time));

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        match decode_one_message(&payload, entry, connections, schemas) {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                chunk = info.idx,
                offset = entry.msg_data_offset,
                time = %entry.received_time,
                error = %err,
                "skipping undecodable message"
            ),
        }
    }
    Ok(messages)
}
