//! Twin protocol envelope.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Twin operation carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Fetch the full twin
    GetRequest,
    /// Full twin document
    GetResponse,
    /// Push a reported-property diff
    UpdateReportedRequest,
    /// Acknowledgement of a reported-property update
    UpdateReportedResponse,
    /// Ask for desired-property notifications
    SubscribeDesiredRequest,
    /// Desired-property snapshot or unsolicited change
    SubscribeDesiredResponse,
}

impl OperationType {
    /// Whether the device originates this operation.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::GetRequest | Self::UpdateReportedRequest | Self::SubscribeDesiredRequest
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetRequest => "get_request",
            Self::GetResponse => "get_response",
            Self::UpdateReportedRequest => "update_reported_request",
            Self::UpdateReportedResponse => "update_reported_response",
            Self::SubscribeDesiredRequest => "subscribe_desired_request",
            Self::SubscribeDesiredResponse => "subscribe_desired_response",
        };
        f.write_str(name)
    }
}

/// Hub status reported for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// 200
    Ok,
    /// 204
    OkEmpty,
    /// 400
    BadFormat,
    /// 401
    Unauthorized,
    /// 403
    TooManyDevices,
    /// 404
    NotFound,
    /// 412
    PreconditionFailed,
    /// 413
    RequestEntityTooLarge,
    /// 429
    Throttled,
    /// 500
    InternalServerError,
    /// 503
    ServerBusy,
    /// Any other code, and local send failures
    Error,
}

impl StatusCode {
    /// Map a numeric hub status.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            200 => Self::Ok,
            204 => Self::OkEmpty,
            400 => Self::BadFormat,
            401 => Self::Unauthorized,
            403 => Self::TooManyDevices,
            404 => Self::NotFound,
            412 => Self::PreconditionFailed,
            413 => Self::RequestEntityTooLarge,
            429 => Self::Throttled,
            500 => Self::InternalServerError,
            503 => Self::ServerBusy,
            _ => Self::Error,
        }
    }

    /// Numeric code, `None` for [`StatusCode::Error`].
    #[must_use]
    pub fn code(self) -> Option<u16> {
        match self {
            Self::Ok => Some(200),
            Self::OkEmpty => Some(204),
            Self::BadFormat => Some(400),
            Self::Unauthorized => Some(401),
            Self::TooManyDevices => Some(403),
            Self::NotFound => Some(404),
            Self::PreconditionFailed => Some(412),
            Self::RequestEntityTooLarge => Some(413),
            Self::Throttled => Some(429),
            Self::InternalServerError => Some(500),
            Self::ServerBusy => Some(503),
            Self::Error => None,
        }
    }

    /// Whether the status signals success.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::OkEmpty)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{self:?}({code})"),
            None => f.write_str("Error"),
        }
    }
}

/// A twin protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Operation carried
    pub operation: OperationType,
    /// Correlation id, absent on pushed notifications
    pub request_id: Option<String>,
    /// Hub status code, absent on requests and pushed notifications
    pub status: Option<u16>,
    /// Codec-rendered body
    pub body: Vec<u8>,
}

impl Envelope {
    /// Create a request envelope.
    #[must_use]
    pub fn request(operation: OperationType, request_id: u64, body: Vec<u8>) -> Self {
        Self {
            operation,
            request_id: Some(request_id.to_string()),
            status: None,
            body,
        }
    }

    /// Create a response envelope.
    #[must_use]
    pub fn response(
        operation: OperationType,
        request_id: impl Into<String>,
        status: u16,
        body: Vec<u8>,
    ) -> Self {
        Self {
            operation,
            request_id: Some(request_id.into()),
            status: Some(status),
            body,
        }
    }

    /// Create an unsolicited desired-property notification.
    #[must_use]
    pub fn desired_notification(body: Vec<u8>) -> Self {
        Self {
            operation: OperationType::SubscribeDesiredResponse,
            request_id: None,
            status: None,
            body,
        }
    }

    /// Status as a typed code.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.status.map(StatusCode::from_code)
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| EnvelopeError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        ciborium::from_reader(bytes).map_err(|e| EnvelopeError::Deserialize(e.to_string()))
    }
}

/// Errors for envelope serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvelopeError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope_cbor_roundtrip() {
        let envelope = Envelope::response(
            OperationType::GetResponse,
            "0",
            200,
            br#"{"reported":{},"desired":{"temp":"72"}}"#.to_vec(),
        );

        let bytes = envelope.to_cbor().unwrap();
        let decoded = Envelope::from_cbor(&bytes).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.status_code(), Some(StatusCode::Ok));
    }

    #[test]
    fn request_ids_are_decimal_strings() {
        let envelope = Envelope::request(OperationType::GetRequest, 17, Vec::new());
        assert_eq!(envelope.request_id.as_deref(), Some("17"));
        assert!(envelope.status.is_none());
        assert!(envelope.operation.is_request());
    }

    #[test]
    fn notification_has_no_correlation() {
        let envelope = Envelope::desired_notification(b"{}".to_vec());
        assert!(envelope.request_id.is_none());
        assert!(envelope.status_code().is_none());
        assert!(!envelope.operation.is_request());
    }

    #[test]
    fn unknown_status_maps_to_error() {
        assert_eq!(StatusCode::from_code(418), StatusCode::Error);
        assert_eq!(StatusCode::from_code(429), StatusCode::Throttled);
        assert!(StatusCode::OkEmpty.is_success());
        assert!(!StatusCode::ServerBusy.is_success());
        assert_eq!(StatusCode::Ok.to_string(), "Ok(200)");
    }

    #[test]
    fn garbage_is_not_an_envelope() {
        assert!(Envelope::from_cbor(b"hello device").is_err());
    }
}
