//! Reads a bag's file header and trailing index region into metadata.
//!
//! A v2.0 bag opens with a 13-byte magic and a header record padded out to
//! 4096 bytes. The header points at the index region near the end of the
//! file, which lists every connection followed by one chunk-info record per
//! chunk. Nothing in between needs to be touched to know the full timeline.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{FormatError, Result};
use crate::record::{read_records, RecordFields, ShallowRecord};
use crate::time::BagTime;

/// The 13-byte magic at offset 0.
pub const MAGIC: &[u8; 13] = b"#ROSBAG V2.0\n";

/// The file header record is padded so that chunk data starts here.
pub const HEADER_PADDING: usize = 4096;

/// Values extracted from the padded file header record.
#[derive(Debug, Clone, Copy)]
pub struct BagHeader {
    pub index_pos: u64,
    pub conn_count: u32,
    pub chunk_count: u32,
}

/// One logical stream: a topic, its message type and schema text.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub conn: u32,
    pub topic: String,
    pub message_type: String,
    pub md5sum: String,
    pub message_definition: String,
}

/// Metadata of one chunk, normalized after the time sort.
///
/// `idx` is the chunk's position in the sorted array and
/// `next_chunk_position` the file offset of its successor (the file length
/// for the last chunk), so `next_chunk_position - chunk_position` is the
/// chunk's on-disk span.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkInfo {
    pub version: u32,
    pub chunk_position: u64,
    pub start_time: BagTime,
    pub end_time: BagTime,
    pub count: u32,
    pub per_conn_counts: Vec<(u32, u32)>,
    pub idx: usize,
    pub next_chunk_position: u64,
}

impl ChunkInfo {
    pub fn span_bytes(&self) -> u64 {
        self.next_chunk_position - self.chunk_position
    }

    /// Whether the chunk's time range intersects `[from, to]`.
    pub fn overlaps(&self, from: BagTime, to: BagTime) -> bool {
        self.start_time <= to && self.end_time >= from
    }
}

/// Everything known about a loaded file without decoding any chunk.
#[derive(Debug, Clone, Serialize)]
pub struct BagMetadata {
    pub connections: HashMap<u32, Connection>,
    pub chunks_info: Vec<ChunkInfo>,
    pub start_time: BagTime,
    pub end_time: BagTime,
}

impl BagMetadata {
    pub fn duration_secs(&self) -> f64 {
        self.end_time.as_secs_f64() - self.start_time.as_secs_f64()
    }

    /// Total message count per connection, summed over all chunks.
    pub fn message_counts(&self) -> HashMap<u32, u64> {
        let mut counts = HashMap::new();
        for chunk in &self.chunks_info {
            for &(conn, count) in &chunk.per_conn_counts {
                *counts.entry(conn).or_default() += count as u64;
            }
        }
        counts
    }
}

/// Validates the magic and parses the padded file header record.
///
/// `buffer` holds the first [`HEADER_PADDING`] bytes of the file (or the
/// whole file, when shorter).
pub fn read_bag_header(buffer: &[u8]) -> Result<BagHeader> {
    if buffer.len() < MAGIC.len() || buffer[..MAGIC.len()] != MAGIC[..] {
        return Err(FormatError::InvalidMagic);
    }
    if buffer.len() < MAGIC.len() + 8 {
        return Err(FormatError::TruncatedHeader);
    }
    let at = MAGIC.len();
    let header_len = u32::from_le_bytes([buffer[at], buffer[at + 1], buffer[at + 2], buffer[at + 3]]);
    if MAGIC.len() + 8 + header_len as usize > buffer.len() {
        return Err(FormatError::HeaderTooLarge {
            header_len,
            buffer_len: buffer.len(),
        });
    }
    let fields = RecordFields::parse(&buffer[at + 4..at + 4 + header_len as usize])?;
    Ok(BagHeader {
        index_pos: fields.u64("index_pos")?,
        conn_count: fields.u32("conn_count")?,
        chunk_count: fields.u32("chunk_count")?,
    })
}

fn parse_connection(record: ShallowRecord<'_>) -> Result<Connection> {
    let conn = record.fields.u32("conn")?;
    let topic = record.fields.string("topic")?;
    // The data payload is a second fields blob; schema fields may be absent.
    let data_fields = RecordFields::parse(record.data)?;
    Ok(Connection {
        conn,
        topic,
        message_type: data_fields.string_or_default("type"),
        md5sum: data_fields.string_or_default("md5sum"),
        message_definition: data_fields.string_or_default("message_definition"),
    })
}

fn parse_chunk_info(record: ShallowRecord<'_>) -> Result<ChunkInfo> {
    let count = record.fields.u32("count")?;
    let mut per_conn_counts = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let entry = record
            .data
            .get(i * 8..i * 8 + 8)
            .ok_or(FormatError::TruncatedRecord {
                offset: record.data_offset + (i * 8) as u64,
            })?;
        let conn = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let messages = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
        per_conn_counts.push((conn, messages));
    }
    Ok(ChunkInfo {
        version: record.fields.u32("ver")?,
        chunk_position: record.fields.u64("chunk_pos")?,
        start_time: record.fields.time("start_time")?,
        end_time: record.fields.time("end_time")?,
        count,
        per_conn_counts,
        // assigned after the time sort
        idx: 0,
        next_chunk_position: 0,
    })
}

/// Parses the trailing index region into [`BagMetadata`].
///
/// `index_buffer` holds the bytes `[header.index_pos, file_length)`:
/// `conn_count` connection records followed by `chunk_count` chunk-info
/// records. Chunks come out sorted by start time with `idx` and
/// `next_chunk_position` assigned.
pub fn read_index(header: &BagHeader, index_buffer: &[u8], file_length: u64) -> Result<BagMetadata> {
    let (connections, consumed) = read_records(
        index_buffer,
        header.conn_count as usize,
        header.index_pos,
        0,
        parse_connection,
    )?;
    let (mut chunks, _) = read_records(
        index_buffer,
        header.chunk_count as usize,
        header.index_pos,
        consumed,
        parse_chunk_info,
    )?;

    if chunks.is_empty() {
        return Err(FormatError::EmptyBag);
    }

    chunks.sort_by(|a, b| a.start_time.cmp(&b.start_time));
    let count = chunks.len();
    for i in 0..count {
        chunks[i].idx = i;
        chunks[i].next_chunk_position = if i + 1 < count {
            chunks[i + 1].chunk_position
        } else {
            file_length
        };
    }

    let start_time = chunks[0].start_time;
    let end_time = chunks[count - 1].end_time;
    tracing::debug!(
        connections = connections.len(),
        chunks = count,
        %start_time,
        %end_time,
        "parsed bag index"
    );

    Ok(BagMetadata {
        connections: connections.into_iter().map(|c| (c.conn, c)).collect(),
        chunks_info: chunks,
        start_time,
        end_time,
    })
}
