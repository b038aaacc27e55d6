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

use super::SubjectTokenFormat;
use crate::Result;
use crate::credentials::subject_token::dynamic::SubjectTokenSource;
use crate::errors::{self, CredentialsError};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;

const MSG: &str = "failed to request subject token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the subject token from a local HTTP endpoint.
#[derive(Debug)]
pub(crate) struct UrlSourcedCredentials {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub format: SubjectTokenFormat,
    client: Client,
}

impl UrlSourcedCredentials {
    pub(crate) fn new(
        url: String,
        headers: Option<HashMap<String, String>>,
        format: SubjectTokenFormat,
    ) -> Self {
        Self {
            url,
            headers: headers.unwrap_or_default(),
            format,
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl SubjectTokenSource for UrlSourcedCredentials {
    async fn subject_token(&self) -> Result<String> {
        let request = self.client.get(&self.url).timeout(REQUEST_TIMEOUT);
        let request = self
            .headers
            .iter()
            .fold(request, |r, (k, v)| r.header(k.as_str(), v.as_str()));

        let response = request
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, MSG))?;

        if !response.status().is_success() {
            let err = errors::from_http_response(response, MSG).await;
            return Err(err);
        }

        let response_text = response.text().await.map_err(|e| {
            let retryable = !e.is_body();
            CredentialsError::from_source(retryable, e)
        })?;

        self.format.extract(&response_text)
    }

    fn provider_type(&self) -> &'static str {
        "url"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders::*};
    use serde_json::json;
    use std::error::Error as _;

    type TestResult = anyhow::Result<()>;

    fn json_format() -> SubjectTokenFormat {
        SubjectTokenFormat::Json {
            field_name: "access_token".to_string(),
        }
    }

    #[tokio::test]
    async fn get_json_token() -> TestResult {
        let response_body = json!({
            "access_token":"an_example_token",
        })
        .to_string();

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/token"),
                request::headers(contains(("metadata", "True"))),
            ])
            .respond_with(status_code(200).body(response_body)),
        );

        let source = UrlSourcedCredentials::new(
            server.url("/token").to_string(),
            Some(HashMap::from([("Metadata".to_string(), "True".to_string())])),
            json_format(),
        );
        let token = source.subject_token().await?;
        assert_eq!(token, "an_example_token");
        assert_eq!(source.provider_type(), "url");
        Ok(())
    }

    #[tokio::test]
    async fn get_text_token() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(status_code(200).body("an_example_token")),
        );

        let source = UrlSourcedCredentials::new(
            server.url("/token").to_string(),
            None,
            SubjectTokenFormat::Text,
        );
        let token = source.subject_token().await?;
        assert_eq!(token, "an_example_token");
        Ok(())
    }

    #[tokio::test]
    async fn get_json_token_missing_field() -> TestResult {
        let response_body = json!({
            "wrong_field":"an_example_token",
        })
        .to_string();

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(status_code(200).body(response_body)),
        );

        let source =
            UrlSourcedCredentials::new(server.url("/token").to_string(), None, json_format());
        let err = source.subject_token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.source().is_none(), "{err:?}");
        assert!(err.to_string().contains("`access_token`"), "{err}");
        Ok(())
    }

    #[test_case::test_case(503, true)]
    #[test_case::test_case(500, true)]
    #[test_case::test_case(429, true)]
    #[test_case::test_case(404, false)]
    #[test_case::test_case(401, false)]
    #[tokio::test]
    async fn http_error(code: u16, transient: bool) -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(status_code(code).body("uh-oh")),
        );

        let source = UrlSourcedCredentials::new(
            server.url("/token").to_string(),
            None,
            SubjectTokenFormat::Text,
        );
        let err = source.subject_token().await.unwrap_err();
        assert_eq!(err.is_transient(), transient, "{err:?}");
        assert!(err.to_string().contains(MSG), "{err}");
        assert!(err.to_string().contains("uh-oh"), "{err}");
        Ok(())
    }
}
