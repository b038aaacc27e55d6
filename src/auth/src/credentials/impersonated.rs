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

//! Service account impersonation.
//!
//! The federated token obtained from the Security Token Service is used to
//! call the IAM Credentials [generateAccessToken] API, which returns an
//! access token for the target service account.
//!
//! [generateAccessToken]: https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateAccessToken

use crate::Result;
use crate::constants::BEARER_TOKEN_TYPE;
use crate::errors::{self, CredentialsError};
use crate::headers_util::X_GOOG_API_CLIENT;
use crate::token::{Token, TokenProvider};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use regex::Regex;
use reqwest::Client;
use std::sync::LazyLock;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

pub(crate) const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);
pub(crate) const MSG: &str = "failed to fetch token";

const SERVICE_ACCOUNT_PATTERN: &str = "/serviceAccounts/([^/]+@[^/]+):generateAccessToken$";

static SERVICE_ACCOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(SERVICE_ACCOUNT_PATTERN).expect("service account pattern is valid")
});

#[derive(serde::Serialize, Debug, PartialEq)]
struct GenerateAccessTokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    delegates: Option<Vec<String>>,
    scope: Vec<String>,
    lifetime: String,
}

#[derive(serde::Deserialize)]
struct GenerateAccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: String,
}

/// Exchanges the tokens of `T` for service account access tokens.
#[derive(Debug)]
pub(crate) struct ImpersonatedTokenProvider<T>
where
    T: TokenProvider,
{
    pub(crate) source: T,
    pub(crate) service_account_impersonation_url: String,
    pub(crate) delegates: Vec<String>,
    pub(crate) scopes: Vec<String>,
    pub(crate) lifetime: Duration,
    pub(crate) metrics_header: String,
    pub(crate) client: Client,
}

#[async_trait::async_trait]
impl<T> TokenProvider for ImpersonatedTokenProvider<T>
where
    T: TokenProvider,
{
    async fn token(&self) -> Result<Token> {
        let source = self.source.token().await?;
        let mut headers = HeaderMap::new();
        let mut authorization =
            HeaderValue::from_str(&format!("{} {}", source.token_type, source.token))
                .map_err(errors::non_retryable)?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(&self.metrics_header) {
            headers.insert(X_GOOG_API_CLIENT, v);
        }

        let delegates = (!self.delegates.is_empty()).then(|| self.delegates.clone());
        generate_access_token(
            &self.client,
            headers,
            delegates,
            self.scopes.clone(),
            self.lifetime,
            &self.service_account_impersonation_url,
        )
        .await
    }
}

/// Extracts the service account email from an impersonation URL.
pub(crate) fn service_account_email(url: &str) -> Option<String> {
    SERVICE_ACCOUNT
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub(crate) async fn generate_access_token(
    client: &Client,
    headers: HeaderMap,
    delegates: Option<Vec<String>>,
    scopes: Vec<String>,
    lifetime: Duration,
    service_account_impersonation_url: &str,
) -> Result<Token> {
    let body = GenerateAccessTokenRequest {
        delegates,
        scope: scopes,
        lifetime: format!("{}s", lifetime.as_secs()),
    };

    let response = client
        .post(service_account_impersonation_url)
        .headers(headers)
        .json(&body)
        .send()
        .await
        .map_err(|e| errors::from_http_error(e, MSG))?;

    if !response.status().is_success() {
        let err = errors::from_http_response(response, MSG).await;
        return Err(err);
    }

    let token_response = response
        .json::<GenerateAccessTokenResponse>()
        .await
        .map_err(|e| {
            let retryable = !e.is_decode();
            CredentialsError::from_source(retryable, e)
        })?;

    let expire_time = OffsetDateTime::parse(
        &token_response.expire_time,
        &time::format_description::well_known::Rfc3339,
    )
    .map_err(errors::non_retryable)?;

    let remaining: Duration = (expire_time - OffsetDateTime::now_utc())
        .try_into()
        .map_err(|_| {
            errors::non_retryable_from_str(format!(
                "{MSG}, the token expired at {}",
                token_response.expire_time
            ))
        })?;

    Ok(Token {
        token: token_response.access_token,
        token_type: BEARER_TOKEN_TYPE.to_string(),
        expires_at: Some(Instant::now() + remaining),
        metadata: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tests::MockTokenProvider;
    use httptest::{Expectation, Server, matchers::*, responders::*};
    use serde_json::json;

    type TestResult = anyhow::Result<()>;

    const PATH: &str = "/v1/projects/-/serviceAccounts/test-principal:generateAccessToken";

    fn expire_in(d: time::Duration) -> String {
        (OffsetDateTime::now_utc() + d)
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap()
    }

    fn source_token() -> MockTokenProvider {
        let mut mock = MockTokenProvider::new();
        mock.expect_token().times(1).returning(|| {
            Ok(Token {
                token: "sts-token".to_string(),
                token_type: "Bearer".to_string(),
                expires_at: None,
                metadata: None,
            })
        });
        mock
    }

    fn provider(server: &Server, source: MockTokenProvider) -> ImpersonatedTokenProvider<MockTokenProvider> {
        ImpersonatedTokenProvider {
            source,
            service_account_impersonation_url: server.url_str(PATH),
            delegates: Vec::new(),
            scopes: vec!["scope1".to_string(), "scope2".to_string()],
            lifetime: DEFAULT_LIFETIME,
            metrics_header: "test-metrics-header".to_string(),
            client: Client::new(),
        }
    }

    #[tokio::test]
    async fn success() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", PATH),
                request::headers(contains(("authorization", "Bearer sts-token"))),
                request::headers(contains(("x-goog-api-client", "test-metrics-header"))),
                request::body(json_decoded(eq(json!({
                    "scope": ["scope1", "scope2"],
                    "lifetime": "3600s",
                })))),
            ])
            .respond_with(json_encoded(json!({
                "accessToken": "test-impersonated-token",
                "expireTime": expire_in(time::Duration::hours(1)),
            }))),
        );

        let now = Instant::now();
        let token = provider(&server, source_token()).token().await?;
        assert_eq!(token.token, "test-impersonated-token");
        assert_eq!(token.token_type, "Bearer");
        let expires_at = token.expires_at.unwrap();
        assert!(expires_at > now + Duration::from_secs(3500), "{expires_at:?}");
        assert!(expires_at <= Instant::now() + Duration::from_secs(3600), "{expires_at:?}");
        Ok(())
    }

    #[tokio::test]
    async fn with_delegates_and_lifetime() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", PATH),
                request::body(json_decoded(eq(json!({
                    "delegates": ["projects/-/serviceAccounts/delegate@example.com"],
                    "scope": ["scope1", "scope2"],
                    "lifetime": "600s",
                })))),
            ])
            .respond_with(json_encoded(json!({
                "accessToken": "test-impersonated-token",
                "expireTime": expire_in(time::Duration::minutes(10)),
            }))),
        );

        let mut provider = provider(&server, source_token());
        provider.delegates = vec!["projects/-/serviceAccounts/delegate@example.com".to_string()];
        provider.lifetime = Duration::from_secs(600);
        let token = provider.token().await?;
        assert_eq!(token.token, "test-impersonated-token");
        Ok(())
    }

    #[test_case::test_case(403, false)]
    #[test_case::test_case(401, false)]
    #[test_case::test_case(503, true)]
    #[tokio::test]
    async fn http_error(code: u16, transient: bool) -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", PATH))
                .respond_with(status_code(code).body("permission denied")),
        );

        let err = provider(&server, source_token()).token().await.unwrap_err();
        assert_eq!(err.is_transient(), transient, "{err:?}");
        assert!(err.to_string().contains(MSG), "{err}");
        assert!(err.to_string().contains("permission denied"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn source_error() {
        let server = Server::run();
        let mut source = MockTokenProvider::new();
        source
            .expect_token()
            .times(1)
            .returning(|| Err(CredentialsError::from_msg(true, "sts failure")));

        let err = provider(&server, source).token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("sts failure"), "{err}");
    }

    #[tokio::test]
    async fn missing_expiry() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", PATH)).respond_with(
                json_encoded(json!({
                    "accessToken": "test-impersonated-token",
                })),
            ),
        );

        let err = provider(&server, source_token()).token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        Ok(())
    }

    #[test_case::test_case(json!("2024-13-45T99:00:00Z"); "invalid format")]
    #[test_case::test_case(json!("yesterday"); "not a date")]
    #[tokio::test]
    async fn invalid_expiry(expire_time: serde_json::Value) -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", PATH)).respond_with(
                json_encoded(json!({
                    "accessToken": "test-impersonated-token",
                    "expireTime": expire_time,
                })),
            ),
        );

        let err = provider(&server, source_token()).token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        Ok(())
    }

    #[test_case::test_case(
        "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/sa@project.iam.gserviceaccount.com:generateAccessToken",
        Some("sa@project.iam.gserviceaccount.com")
    )]
    #[test_case::test_case(
        "http://127.0.0.1:8080/v1/projects/-/serviceAccounts/test@example.com:generateAccessToken",
        Some("test@example.com")
    )]
    #[test_case::test_case(PATH, None; "missing email domain")]
    #[test_case::test_case("https://example.com/impersonate", None)]
    fn email_from_url(url: &str, want: Option<&str>) {
        assert_eq!(service_account_email(url).as_deref(), want);
    }

    #[tokio::test]
    async fn expired_token() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", PATH)).respond_with(
                json_encoded(json!({
                    "accessToken": "test-impersonated-token",
                    "expireTime": expire_in(-time::Duration::hours(1)),
                })),
            ),
        );

        let err = provider(&server, source_token()).token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("expired"), "{err}");
        Ok(())
    }
}
