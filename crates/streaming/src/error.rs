use std::fmt;

use formats::DecodeError;
use runtime::DispatchError;
use serde::Serialize;
use thiserror::Error;

/// Failure reported by an external collaborator (byte source, directory,
/// spatial index).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SourceError {
    pub message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The byte source could not deliver the resolved range.
    #[error("bytes {offset}..+{length} unavailable from {archive}: {reason}")]
    RangeUnavailable {
        archive: String,
        offset: u64,
        length: u64,
        reason: String,
    },

    #[error("failed to decompress tile {tile}: {reason}")]
    Decompress { tile: String, reason: String },

    #[error("tile directory lookup failed: {0}")]
    Directory(String),

    #[error("request covers {count} tiles at z{zoom}, limit is {limit}")]
    TooManyTiles { zoom: u8, count: u64, limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The query was cancelled; never reported to sinks.
    #[error("stream aborted by cancellation")]
    AbortedByCancellation,

    #[error("spatial source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Coarse classification handed to `LoadSink::on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedWireFormat,
    UnsupportedGeometry,
    InvalidRecord,
    RangeUnavailable,
    Decompress,
    Directory,
    TooManyTiles,
    Source,
    Dispatch,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedWireFormat => "malformed_wire_format",
            ErrorKind::UnsupportedGeometry => "unsupported_geometry",
            ErrorKind::InvalidRecord => "invalid_record",
            ErrorKind::RangeUnavailable => "range_unavailable",
            ErrorKind::Decompress => "decompress",
            ErrorKind::Directory => "directory",
            ErrorKind::TooManyTiles => "too_many_tiles",
            ErrorKind::Source => "source",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can end a single load request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Decode(e) | LoadError::Stream(StreamError::Decode(e)) => decode_kind(e),
            LoadError::Fetch(FetchError::RangeUnavailable { .. }) => ErrorKind::RangeUnavailable,
            LoadError::Fetch(FetchError::Decompress { .. }) => ErrorKind::Decompress,
            LoadError::Fetch(FetchError::Directory(_)) => ErrorKind::Directory,
            LoadError::Fetch(FetchError::TooManyTiles { .. }) => ErrorKind::TooManyTiles,
            LoadError::Stream(StreamError::AbortedByCancellation) => ErrorKind::Cancelled,
            LoadError::Stream(StreamError::Source(_)) => ErrorKind::Source,
            LoadError::Dispatch(DispatchError::Aborted(_)) => ErrorKind::Cancelled,
            LoadError::Dispatch(_) => ErrorKind::Dispatch,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

fn decode_kind(e: &DecodeError) -> ErrorKind {
    match e {
        DecodeError::MalformedWireFormat { .. } => ErrorKind::MalformedWireFormat,
        DecodeError::UnsupportedGeometry { .. } => ErrorKind::UnsupportedGeometry,
        DecodeError::InvalidRecord { .. } => ErrorKind::InvalidRecord,
    }
}
