//! Streaming structured-output decoding

pub mod decoder;
pub mod latex;

pub use decoder::{answer_schema, DecodedAnswer, StreamDecoder, SOURCES_MARKER};
pub use latex::{protect, unescape_json};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("Response schema does not require field `{0}`")]
    MissingField(&'static str),

    #[error("Response schema must declare `answer` before `sources` for streaming")]
    FieldOrder,
}
