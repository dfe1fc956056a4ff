use hyper::StatusCode;
use thiserror::Error;

use crate::statuses::{self, reason_phrase, status_for_io_error};

/// Typed request failure surfaced to the client as an HTTP response.
///
/// Carries the status, a plain-text message used as the response body, and
/// optional extra headers. Errors raised by the user hook pass through
/// verbatim; transport errors get mapped onto the synthetic bad-gateway
/// codes first.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RequestError {
    pub status_code: StatusCode,
    pub message: String,
    pub headers: Vec<(String, String)>,
    // Unexpected errors (not deliberately raised) are reported through the
    // requestFailed event in addition to the client response.
    pub(crate) unexpected: bool,
}

impl RequestError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::from_u16(status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: message.into(),
            headers: Vec::new(),
            unexpected: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// 407 challenge sent when the hook requests authentication.
    pub fn auth_required(fail_msg: Option<String>) -> Self {
        Self::new(
            407,
            fail_msg.unwrap_or_else(|| "Proxy credentials required.".to_string()),
        )
    }

    /// Map a transport error onto its synthetic bad-gateway status.
    pub fn from_io(err: &std::io::Error) -> Self {
        let status = status_for_io_error(err);
        let mut this = Self::new(status, reason_phrase(status));
        this.unexpected = true;
        this
    }

    /// Upstream answered a CONNECT with a non-200 status. Credential
    /// rejections surface as AUTH_FAILED, everything else as NON_200.
    pub fn upstream_non_200(upstream_status: u16) -> Self {
        let status = if upstream_status == 401 || upstream_status == 407 {
            statuses::AUTH_FAILED
        } else {
            statuses::NON_200_STATUS_CODE
        };
        Self::new(status, format!("UPSTREAM{}", upstream_status))
    }

    /// Normalize credential failures from upstream-proxy URLs.
    pub(crate) fn from_credentials(err: &crate::headers::CredentialsError) -> Self {
        match err {
            crate::headers::CredentialsError::InvalidColonInUsername => Self::new(
                statuses::AUTH_FAILED,
                "Invalid colon in username in upstream proxy credentials",
            ),
            crate::headers::CredentialsError::InvalidEncoding => Self::new(
                statuses::AUTH_FAILED,
                "Invalid upstream proxy credentials",
            ),
        }
    }

    /// Wrap an error that was not deliberately raised anywhere.
    pub fn generic(message: impl Into<String>) -> Self {
        let mut this = Self::new(500, message);
        this.unexpected = true;
        this
    }

    pub(crate) fn generic_from(err: anyhow::Error) -> Self {
        Self::generic(err.to_string())
    }

    pub fn status(&self) -> u16 {
        self.status_code.as_u16()
    }
}
