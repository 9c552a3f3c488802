use thiserror::Error;

pub type Result<T> = std::result::Result<T, FormatError>;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("file does not start with the `#ROSBAG V2.0` magic")]
    InvalidMagic,

    #[error("file is too short to hold a bag header")]
    TruncatedHeader,

    #[error("bag header length {header_len} exceeds the {buffer_len} byte header region")]
    HeaderTooLarge { header_len: u32, buffer_len: usize },

    #[error("record header field has no `=` separator")]
    MissingEquals,

    #[error("record data ends unexpectedly at offset {offset}")]
    TruncatedRecord { offset: u64 },

    #[error("record is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("failed to parse message definition: {0}")]
    SchemaParse(String),

    #[error("unsupported chunk compression `{0}`")]
    UnsupportedCompression(String),

    #[error("chunk decompression failed: {0}")]
    Decompression(String),

    #[error("message definition references unknown type `{0}`")]
    UnknownType(String),

    #[error("failed to decode message: {0}")]
    MessageDecode(String),

    #[error("bag contains no chunks")]
    EmptyBag,
}

impl From<std::io::Error> for FormatError {
    fn from(err: std::io::Error) -> Self {
        FormatError::MessageDecode(err.to_string())
    }
}
