use std::fmt;

/// Error kinds surfaced to callers of this crate.
///
/// Internal plumbing uses [`anyhow::Result`] so collaborators can bubble up
/// whatever context they have; at the public boundary that gets folded into
/// one of these variants, keeping the underlying cause attached via `source`
/// wherever one is available rather than only flattening it into `message`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket, multicast or HTTP transport failure.
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// A peer sent a message that violates the wire format (SSDP, SOAP, GENA).
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// A device/service description or SCPD document could not be parsed.
    #[error("invalid description: {message}")]
    InvalidDescription {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// The operation is not valid for the control point's current lifecycle state.
    #[error("invalid state: {message}")]
    InvalidState {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// A requested device, service, action or state variable does not exist.
    #[error("not found: {message}")]
    NotFound {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn network(msg: impl fmt::Display) -> Self {
        Self::Network {
            message: msg.to_string(),
            source: None,
        }
    }

    /// Like [`Error::network`], but keeps `source` as the error's `source()`
    /// instead of only flattening it into the message string.
    pub(crate) fn network_with_source(msg: impl fmt::Display, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Network {
            message: msg.to_string(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn protocol(msg: impl fmt::Display) -> Self {
        Self::Protocol {
            message: msg.to_string(),
            source: None,
        }
    }

    pub(crate) fn invalid_description(msg: impl fmt::Display) -> Self {
        Self::InvalidDescription {
            message: msg.to_string(),
            source: None,
        }
    }

    pub(crate) fn invalid_state(msg: impl fmt::Display) -> Self {
        Self::InvalidState {
            message: msg.to_string(),
            source: None,
        }
    }

    pub(crate) fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound {
            message: msg.to_string(),
            source: None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        Self::Protocol {
            message,
            source: Some(err.into()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Network {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_with_source_exposes_the_cause() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::from(io_err);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn plain_constructors_carry_no_source() {
        let err = Error::not_found("no such device");
        assert!(std::error::Error::source(&err).is_none());
    }
}
