//! Schema-driven decoding of serialized message payloads.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;

use crate::error::{FormatError, Result};
use crate::schema::{MsgField, MsgSchema};
use crate::time::BagTime;

/// A decoded field value.
///
/// 64-bit integers keep their full range; constants are carried in their
/// textual form, as written in the message definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Time(BagTime),
    Array(Vec<Value>),
    Message(BTreeMap<String, Value>),
}

/// Decodes one message payload against its compiled schema.
pub fn decode_message(schema: &MsgSchema, data: &[u8]) -> Result<Value> {
    let mut cursor = Cursor::new(data);
    let fields = decode_fields(&schema.top_level, &schema.nested_types, &mut cursor)?;
    Ok(Value::Message(fields))
}

// Each invocation builds a fresh map so recursive decodes of nested types
// cannot clobber their caller's output.
fn decode_fields(
    fields: &[MsgField],
    nested_types: &HashMap<String, MsgField>,
    cursor: &mut Cursor<&[u8]>,
) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for field in fields {
        // `json` fields occupy no bytes and decode to nothing.
        if field.key_type == "json" {
            continue;
        }
        out.insert(field.key.clone(), decode_field(field, nested_types, cursor)?);
    }
    Ok(out)
}

fn decode_field(
    field: &MsgField,
    nested_types: &HashMap<String, MsgField>,
    cursor: &mut Cursor<&[u8]>,
) -> Result<Value> {
    if let Some(constant) = &field.constant_value {
        return Ok(Value::String(constant.clone()));
    }
    if field.is_array {
        let len = match field.array_length {
            Some(len) => len,
            None => cursor.read_u32::<LittleEndian>()?,
        };
        let mut items = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            items.push(decode_scalar(field, nested_types, cursor)?);
        }
        return Ok(Value::Array(items));
    }
    decode_scalar(field, nested_types, cursor)
}

fn decode_scalar(
    field: &MsgField,
    nested_types: &HashMap<String, MsgField>,
    cursor: &mut Cursor<&[u8]>,
) -> Result<Value> {
    let value = match field.key_type.as_str() {
        "bool" => Value::Bool(cursor.read_u8()? != 0),
        "int8" | "byte" => Value::I8(cursor.read_i8()?),
        "uint8" | "char" => Value::U8(cursor.read_u8()?),
        "int16" => Value::I16(cursor.read_i16::<LittleEndian>()?),
        "uint16" => Value::U16(cursor.read_u16::<LittleEndian>()?),
        "int32" => Value::I32(cursor.read_i32::<LittleEndian>()?),
        "uint32" => Value::U32(cursor.read_u32::<LittleEndian>()?),
        "int64" => Value::I64(cursor.read_i64::<LittleEndian>()?),
        "uint64" => Value::U64(cursor.read_u64::<LittleEndian>()?),
        "float32" => Value::F32(cursor.read_f32::<LittleEndian>()?),
        "float64" => Value::F64(cursor.read_f64::<LittleEndian>()?),
        "string" => {
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0; len];
            cursor.read_exact(&mut buf)?;
            Value::String(String::from_utf8_lossy(&buf).into_owned())
        }
        "time" | "duration" => {
            let mut buf = [0; 8];
            cursor.read_exact(&mut buf)?;
            Value::Time(BagTime::from_le_bytes(buf))
        }
        other => {
            let nested = nested_types
                .get(other)
                .ok_or_else(|| FormatError::UnknownType(other.to_owned()))?;
            Value::Message(decode_fields(&nested.nested_keys, nested_types, cursor)?)
        }
    };
    Ok(value)
}
