use thiserror::Error;

/// Failure to turn a raw buffer or record into features.
///
/// Any of these aborts the whole buffer: no partial feature list is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Truncated buffer, invalid tag, a field carrying the wrong wire type, or
    /// a command stream that does not follow the geometry grammar. `location`
    /// names the message, or the layer, feature and command index.
    #[error("malformed wire format in {location}: {reason}")]
    MalformedWireFormat { location: String, reason: String },

    #[error("unsupported geometry: {geometry}")]
    UnsupportedGeometry { geometry: String },

    /// A streamed record that is not a usable feature object.
    #[error("invalid feature record: {reason}")]
    InvalidRecord { reason: String },
}

impl DecodeError {
    pub(crate) fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        DecodeError::MalformedWireFormat {
            location: location.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_record(reason: impl Into<String>) -> Self {
        DecodeError::InvalidRecord {
            reason: reason.into(),
        }
    }
}

impl From<prost::DecodeError> for DecodeError {
    fn from(err: prost::DecodeError) -> Self {
        DecodeError::malformed("tile", err.to_string())
    }
}
