use std::error::Error as StdError;
use std::fmt::{Display, Formatter};

use serde_json::{json, Value as JsonValue};

/// Error codes carried on the wire as `system.*` strings.
///
/// Services may reply with codes outside this set; those are preserved
/// verbatim in the `Service` variant so they reach the client unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    AccessDenied,
    InternalError,
    Timeout,
    NoSubscription,
    SubscriptionLimitExceeded,
    DisposedSubscription,
    InvalidRequest,
    Service(String),
}

impl ErrorCode {
    pub fn code_str(&self) -> &str {
        match self {
            ErrorCode::NotFound => "system.notFound",
            ErrorCode::AccessDenied => "system.accessDenied",
            ErrorCode::InternalError => "system.internalError",
            ErrorCode::Timeout => "system.timeout",
            ErrorCode::NoSubscription => "system.noSubscription",
            ErrorCode::SubscriptionLimitExceeded => "system.subscriptionLimitExceeded",
            ErrorCode::DisposedSubscription => "system.disposedSubscription",
            ErrorCode::InvalidRequest => "system.invalidRequest",
            ErrorCode::Service(code) => code,
        }
    }

    pub fn from_code_str(code: &str) -> Self {
        match code {
            "system.notFound" => ErrorCode::NotFound,
            "system.accessDenied" => ErrorCode::AccessDenied,
            "system.internalError" => ErrorCode::InternalError,
            "system.timeout" => ErrorCode::Timeout,
            "system.noSubscription" => ErrorCode::NoSubscription,
            "system.subscriptionLimitExceeded" => ErrorCode::SubscriptionLimitExceeded,
            "system.disposedSubscription" => ErrorCode::DisposedSubscription,
            "system.invalidRequest" => ErrorCode::InvalidRequest,
            other => ErrorCode::Service(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Error {
    pub code: ErrorCode,
    message: String,
    data: Option<JsonValue>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn code_str(&self) -> &str {
        self.code.code_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&JsonValue> {
        self.data.as_ref()
    }

    /// True when the error indicates the resource no longer exists, in which
    /// case the cache synthesises a delete cascade.
    pub fn is_gone(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    /// Renders the wire shape `{code, message, data?}`.
    pub fn to_json(&self) -> JsonValue {
        let mut obj = json!({
            "code": self.code_str(),
            "message": self.message,
        });
        if let Some(data) = &self.data {
            obj["data"] = data.clone();
        }
        obj
    }

    /// Parses the wire shape; unknown or missing fields degrade to an
    /// internal error rather than failing the caller.
    pub fn from_json(value: &JsonValue) -> Self {
        let code = value
            .get("code")
            .and_then(JsonValue::as_str)
            .map(ErrorCode::from_code_str)
            .unwrap_or(ErrorCode::InternalError);
        let message = value
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let data = value.get("data").cloned();
        Self {
            code,
            message,
            data,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl StdError for Error {}

pub type Result<T> = std::result::Result<T, Error>;

pub fn not_found() -> Error {
    Error::new(ErrorCode::NotFound, "Not found")
}

pub fn access_denied() -> Error {
    Error::new(ErrorCode::AccessDenied, "Access denied")
}

pub fn internal_error(message: impl Into<String>) -> Error {
    Error::new(ErrorCode::InternalError, message)
}

pub fn timeout() -> Error {
    Error::new(ErrorCode::Timeout, "Request timeout")
}

pub fn no_subscription() -> Error {
    Error::new(ErrorCode::NoSubscription, "No subscription")
}

pub fn subscription_limit_exceeded() -> Error {
    Error::new(
        ErrorCode::SubscriptionLimitExceeded,
        "Subscription limit exceeded",
    )
}

pub fn disposed_subscription() -> Error {
    Error::new(ErrorCode::DisposedSubscription, "Subscription is disposed")
}

pub fn invalid_request(message: impl Into<String>) -> Error {
    Error::new(ErrorCode::InvalidRequest, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_wire_shape() {
        let err = invalid_request("bad payload").with_data(json!({"field": "idx"}));
        assert_eq!(
            err.to_json(),
            json!({
                "code": "system.invalidRequest",
                "message": "bad payload",
                "data": {"field": "idx"},
            })
        );
    }

    #[test]
    fn preserves_service_codes() {
        let err = Error::from_json(&json!({
            "code": "service.outOfCheese",
            "message": "no cheese",
        }));
        assert_eq!(err.code_str(), "service.outOfCheese");
        assert!(!err.is_gone());
    }

    #[test]
    fn not_found_is_gone() {
        let err = Error::from_json(&json!({"code": "system.notFound", "message": "gone"}));
        assert!(err.is_gone());
    }
}
