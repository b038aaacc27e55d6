// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Common errors generated by the components in this crate.

use http::StatusCode;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter, Result};
use std::sync::Arc;

pub use crate::credentials::subject_token::SubjectTokenProviderError;

/// Represents an error using [Credentials].
///
/// Fetching access tokens for external accounts involves several network
/// round trips: obtaining the subject token, exchanging it with the Security
/// Token Service, and optionally impersonating a service account. Any of
/// these steps may fail. Some failures are transient (the STS endpoint was
/// temporarily unavailable), others are permanent (the executable returned a
/// malformed response).
///
/// Applications rarely need to create instances of this error type. The
/// exception might be when testing application code, or when implementing a
/// [SubjectTokenProvider] and mapping its errors.
///
/// [Credentials]: crate::credentials::Credentials
/// [SubjectTokenProvider]: crate::credentials::subject_token::SubjectTokenProvider
#[derive(Clone, Debug)]
pub struct CredentialsError {
    /// A boolean value indicating whether the error is transient.
    ///
    /// If `true`, the operation that resulted in this error might succeed upon
    /// retry.
    is_transient: bool,

    /// A human readable description of the failure, may be empty.
    message: Option<String>,

    /// The underlying source of the error.
    source: Option<Arc<dyn Error + Send + Sync>>,
}

impl CredentialsError {
    /// Creates a new `CredentialsError` with a message and a source.
    ///
    /// # Arguments
    /// * `is_transient` - A boolean indicating whether the error is transient.
    /// * `message` - A description of the failure.
    /// * `source` - The underlying error that caused the auth failure.
    pub fn new<M, T>(is_transient: bool, message: M, source: T) -> Self
    where
        M: Into<String>,
        T: Error + Send + Sync + 'static,
    {
        CredentialsError {
            is_transient,
            message: Some(message.into()),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a new `CredentialsError` from a message.
    ///
    /// # Example
    /// ```
    /// # use google_cloud_auth_external_account::errors::CredentialsError;
    /// let err = CredentialsError::from_msg(
    ///     true, "simulated transient error while trying to create credentials");
    /// assert!(err.is_transient());
    /// assert!(format!("{err}").contains("simulated transient error"));
    /// ```
    pub fn from_msg<M: Into<String>>(is_transient: bool, message: M) -> Self {
        CredentialsError {
            is_transient,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Creates a new `CredentialsError` wrapping another error.
    pub fn from_source<T: Error + Send + Sync + 'static>(is_transient: bool, source: T) -> Self {
        CredentialsError {
            is_transient,
            message: None,
            source: Some(Arc::new(source)),
        }
    }

    /// Returns `true` if the error is transient and may succeed in future
    /// attempts.
    pub fn is_transient(&self) -> bool {
        self.is_transient
    }
}

impl std::error::Error for CredentialsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|arc| arc.as_ref() as &(dyn std::error::Error + 'static))
    }
}

const TRANSIENT_MSG: &str = "but future attempts may succeed";
const PERMANENT_MSG: &str = "and future attempts will not succeed";

impl Display for CredentialsError {
    /// Formats the error message to include transience and source.
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let msg = if self.is_transient {
            TRANSIENT_MSG
        } else {
            PERMANENT_MSG
        };
        match (&self.message, &self.source) {
            (Some(m), Some(s)) => write!(f, "cannot create access token, {msg}: {m}, source: {s}"),
            (Some(m), None) => write!(f, "cannot create access token, {msg}: {m}"),
            (None, Some(s)) => write!(f, "cannot create access token, {msg}, source: {s}"),
            (None, None) => write!(f, "cannot create access token, {msg}"),
        }
    }
}

pub(crate) fn is_retryable(c: StatusCode) -> bool {
    match c {
        // Internal server errors do not indicate that there is anything wrong
        // with our request, so we retry them.
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => true,
        _ => false,
    }
}

/// A helper to create a non-transient error.
pub(crate) fn non_retryable<T: Error + Send + Sync + 'static>(source: T) -> CredentialsError {
    CredentialsError::from_source(false, source)
}

pub(crate) fn non_retryable_from_str<T: Into<String>>(message: T) -> CredentialsError {
    CredentialsError::from_msg(false, message)
}

/// Maps a failure to send an HTTP request.
///
/// Connection problems and timeouts are transient. Everything else, e.g. a
/// badly formatted URL, will fail again.
pub(crate) fn from_http_error(err: reqwest::Error, msg: &str) -> CredentialsError {
    let transient = err.is_connect() || err.is_timeout() || err.is_request();
    CredentialsError::new(transient, msg, err)
}

/// Maps an unsuccessful HTTP response, consuming its body for the message.
pub(crate) async fn from_http_response(response: reqwest::Response, msg: &str) -> CredentialsError {
    let transient = is_retryable(response.status());
    from_http_response_with(response, msg, transient).await
}

/// Like [from_http_response], with the transience decided by the caller.
pub(crate) async fn from_http_response_with(
    response: reqwest::Response,
    msg: &str,
    transient: bool,
) -> CredentialsError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    CredentialsError::from_msg(
        transient,
        format!("{msg}, failed with status {status}, body=<{body}>"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(StatusCode::INTERNAL_SERVER_ERROR)]
    #[test_case(StatusCode::SERVICE_UNAVAILABLE)]
    #[test_case(StatusCode::REQUEST_TIMEOUT)]
    #[test_case(StatusCode::TOO_MANY_REQUESTS)]
    fn retryable(c: StatusCode) {
        assert!(is_retryable(c));
    }

    #[test_case(StatusCode::NOT_FOUND)]
    #[test_case(StatusCode::UNAUTHORIZED)]
    #[test_case(StatusCode::BAD_REQUEST)]
    #[test_case(StatusCode::BAD_GATEWAY)]
    #[test_case(StatusCode::PRECONDITION_FAILED)]
    fn non_retryable(c: StatusCode) {
        assert!(!is_retryable(c));
    }

    #[test_case(true)]
    #[test_case(false)]
    fn new(transient: bool) {
        let source = std::io::Error::other("test-only-source");
        let got = CredentialsError::new(transient, "test-only-message", source);
        assert_eq!(got.is_transient(), transient, "{got}");
        assert!(got.source().is_some(), "{got}");
        let fmt = format!("{got}");
        assert!(fmt.contains("test-only-message"), "{fmt}");
        assert!(fmt.contains("test-only-source"), "{fmt}");
    }

    #[test_case(true)]
    #[test_case(false)]
    fn from_source(transient: bool) {
        let source = std::io::Error::other("test-only");
        let got = CredentialsError::from_source(transient, source);
        assert_eq!(got.is_transient(), transient, "{got}");
        assert!(got.source().is_some(), "{got}");
        assert!(format!("{got}").contains("test-only"), "{got}");
    }

    #[test]
    fn fmt() {
        let e = CredentialsError::from_msg(true, "test-only-err-123");
        let got = format!("{e}");
        assert!(got.contains("test-only-err-123"), "{got}");
        assert!(got.contains(TRANSIENT_MSG), "{got}");
        assert!(e.source().is_none(), "{e:?}");

        let e = CredentialsError::from_msg(false, "test-only-err-123");
        let got = format!("{e}");
        assert!(got.contains("test-only-err-123"), "{got}");
        assert!(got.contains(PERMANENT_MSG), "{got}");
    }

    #[tokio::test]
    async fn http_response() -> anyhow::Result<()> {
        use httptest::{Expectation, Server, matchers::*, responders::*};

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/unavailable"))
                .respond_with(status_code(503).body("try-again")),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/denied"))
                .respond_with(status_code(403).body("go-away")),
        );

        let response = reqwest::get(server.url("/unavailable").to_string()).await?;
        let err = from_http_response(response, "test-only").await;
        assert!(err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("try-again"), "{err}");
        assert!(err.to_string().contains("503"), "{err}");

        let response = reqwest::get(server.url("/denied").to_string()).await?;
        let err = from_http_response(response, "test-only").await;
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("go-away"), "{err}");
        Ok(())
    }
}
