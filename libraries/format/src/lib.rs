//! Parsing support for the ROS bag v2.0 container format.
//!
//! This crate covers the synchronous half of bag playback: the
//! length-prefixed record framing, the file header and trailing index
//! region, message-definition schemas, and the decoding of chunk payloads
//! into dynamically typed messages. Everything operates on in-memory byte
//! buffers; fetching those buffers from a file is the player's job.

pub mod chunk;
pub mod compression;
pub mod decode;
pub mod error;
pub mod inspector;
pub mod record;
pub mod schema;
pub mod time;

pub use chunk::{decode_chunk, RosbagMessage};
pub use decode::{decode_message, Value};
pub use error::{FormatError, Result};
pub use inspector::{
    read_bag_header, read_index, BagHeader, BagMetadata, ChunkInfo, Connection, HEADER_PADDING,
    MAGIC,
};
pub use record::{read_records, RecordFields, ShallowRecord};
pub use schema::{parse_message_definition, MsgField, MsgSchema, SchemaCache};
pub use time::BagTime;
