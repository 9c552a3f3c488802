//! Compiles free-form ROS message-definition text into a typed schema.
//!
//! A definition lists one field per line. Nested complex types are appended
//! to the same string, each introduced by a `MSG: <type-name>` separator
//! line. Comment lines (`#`), separator rules (`==`) and blank lines carry
//! no information and are dropped before scanning.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FormatError, Result};

/// One node of a compiled schema tree.
///
/// Top-level fields leave `nested_keys` empty; entries of
/// [`MsgSchema::nested_types`] hold their own field list there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MsgField {
    pub key: String,
    pub key_type: String,
    pub is_array: bool,
    pub array_length: Option<u32>,
    pub constant_value: Option<String>,
    pub nested_keys: Vec<MsgField>,
}

/// A compiled message definition: the top-level field list plus every
/// nested type it references, keyed by lowercased unqualified type name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MsgSchema {
    pub top_level: Vec<MsgField>,
    pub nested_types: HashMap<String, MsgField>,
}

/// Reduces a possibly package-qualified type name (`pkg/Type`) to its
/// lowercased last segment. All type comparisons happen in this form.
fn normalize_type(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_ascii_lowercase()
}

fn parse_field_line(line: &str) -> Result<MsgField> {
    let mut tokens = line.split_whitespace();
    let raw_type = tokens.next().unwrap_or_default();
    let key = tokens.next().unwrap_or_default();
    let rest: Vec<&str> = tokens.collect();

    let (base_type, is_array, array_length) = match raw_type
        .strip_suffix(']')
        .and_then(|prefix| prefix.rsplit_once('['))
    {
        Some((head, digits))
            if !head.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) =>
        {
            let len = if digits.is_empty() {
                None
            } else {
                Some(digits.parse::<u32>().map_err(|err| {
                    FormatError::SchemaParse(format!("bad array length in `{line}`: {err}"))
                })?)
            };
            (head, true, len)
        }
        _ => (raw_type, false, None),
    };

    let mut field = MsgField {
        key_type: normalize_type(base_type),
        is_array,
        array_length,
        ..Default::default()
    };

    if rest.len() == 2 && rest[0] == "=" {
        field.key = key.to_owned();
        field.constant_value = Some(rest[1].to_owned());
    } else if let Some((name, value)) = key.split_once('=') {
        field.key = name.to_owned();
        field.constant_value = Some(value.to_owned());
    } else {
        field.key = key.to_owned();
    }
    Ok(field)
}

fn finalize_nested(mut pending: MsgField, nested_types: &mut HashMap<String, MsgField>) {
    let name = normalize_type(&pending.key);
    pending.key_type = name.clone();
    nested_types.insert(name, pending);
}

/// Parses a message-definition text into a [`MsgSchema`].
pub fn parse_message_definition(definition: &str) -> Result<MsgSchema> {
    let mut top_level = Vec::new();
    let mut nested_types = HashMap::new();
    let mut pending: Option<MsgField> = None;

    let lines = definition
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("=="));

    for line in lines {
        let field = parse_field_line(line)?;
        if field.key_type == "msg:" {
            if let Some(done) = pending.take().filter(|p| !p.key.is_empty()) {
                finalize_nested(done, &mut nested_types);
            }
            pending = Some(MsgField {
                key: field.key,
                ..Default::default()
            });
        } else if let Some(nested) = pending.as_mut().filter(|p| !p.key.is_empty()) {
            nested.nested_keys.push(field);
        } else {
            top_level.push(field);
        }
    }
    if let Some(done) = pending.take().filter(|p| !p.key.is_empty()) {
        finalize_nested(done, &mut nested_types);
    }

    Ok(MsgSchema {
        top_level,
        nested_types,
    })
}

/// Compiled schemas interned per message type.
///
/// Scoped to one loaded file so identically named types from different
/// files can never observe each other's definitions.
#[derive(Debug, Default)]
pub struct SchemaCache {
    schemas: HashMap<String, Arc<MsgSchema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled schema for `message_type`, parsing and caching
    /// `definition` on the first request.
    pub fn get_or_compile(&mut self, message_type: &str, definition: &str) -> Result<Arc<MsgSchema>> {
        if let Some(schema) = self.schemas.get(message_type) {
            return Ok(schema.clone());
        }
        let schema = Arc::new(parse_message_definition(definition)?);
        self.schemas.insert(message_type.to_owned(), schema.clone());
        Ok(schema)
    }

    pub fn clear(&mut self) {
        self.schemas.clear();
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
