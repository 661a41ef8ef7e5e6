use thiserror::Error;

/// Rejection of a malformed inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl DecodeError {
    /// Name of the offending field, when the error is tied to one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Malformed(_) => None,
            Self::MissingField(field) => Some(field),
            Self::InvalidField { field, .. } => Some(field),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("payload does not match message type '{kind}'")]
    PayloadMismatch { kind: String },

    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),
}
