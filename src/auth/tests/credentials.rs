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

use google_cloud_auth_external_account::credentials::external_account::{
    Builder, CredentialSource,
};
use google_cloud_auth_external_account::credentials::subject_token::{
    SubjectTokenProvider, SubjectTokenProviderError, SupplierContext,
};
use httptest::{Expectation, Server, matchers::*, responders::*};
use serde_json::json;

type TestResult = anyhow::Result<()>;

const AUDIENCE: &str = "//iam.googleapis.com/projects/123/locations/global/workloadIdentityPools/my-pool/providers/my-provider";
const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http::header::AUTHORIZATION;
    use std::fmt;

    #[derive(Debug)]
    struct ProviderError;

    impl fmt::Display for ProviderError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "identity provider is unavailable")
        }
    }

    impl std::error::Error for ProviderError {}

    impl SubjectTokenProviderError for ProviderError {
        fn is_transient(&self) -> bool {
            true
        }
    }

    #[derive(Debug)]
    struct AppProvider {
        fail: bool,
    }

    impl SubjectTokenProvider for AppProvider {
        type Error = ProviderError;

        async fn subject_token(&self, context: &SupplierContext) -> Result<String, ProviderError> {
            if self.fail {
                return Err(ProviderError);
            }
            assert_eq!(context.audience(), AUDIENCE);
            assert_eq!(context.subject_token_type(), JWT_TOKEN_TYPE);
            Ok("app-subject-token".to_string())
        }
    }

    fn expect_exchange(server: &Server, subject_token: &'static str) {
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/token"),
                request::body(url_decoded(contains(("subject_token", subject_token)))),
                request::body(url_decoded(contains(("audience", AUDIENCE)))),
                request::headers(contains(key("x-goog-api-client"))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "federated-token",
                "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
                "token_type": "Bearer",
                "expires_in": 3600,
            }))),
        );
    }

    #[tokio::test]
    async fn url_sourced_from_json() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/subject"),
                request::headers(contains(("metadata", "True"))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({"access_token": "url-subject-token"}))),
        );
        expect_exchange(&server, "url-subject-token");

        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": server.url_str("/v1/token"),
            "quota_project_id": "test-quota-project",
            "credential_source": {
                "url": server.url_str("/subject"),
                "headers": {"Metadata": "True"},
                "format": {"type": "json", "subject_token_field_name": "access_token"}
            }
        });
        let credentials = Builder::from_json(config).build()?;

        let headers = credentials.headers().await?;
        assert_eq!(
            headers.get(AUTHORIZATION),
            Some(&HeaderValue::from_static("Bearer federated-token"))
        );
        assert_eq!(
            headers.get("x-goog-user-project"),
            Some(&HeaderValue::from_static("test-quota-project"))
        );

        // Cached, no more requests.
        let token = credentials.token().await?;
        assert_eq!(token.token, "federated-token");
        Ok(())
    }

    #[tokio::test]
    async fn file_sourced() -> TestResult {
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), "file-subject-token")?;
        let server = Server::run();
        expect_exchange(&server, "file-subject-token");

        let credentials = Builder::new()
            .with_audience(AUDIENCE)
            .with_subject_token_type(JWT_TOKEN_TYPE)
            .with_token_url(server.url_str("/v1/token"))
            .with_credential_source(CredentialSource::File {
                file: file.path().to_string_lossy().to_string(),
                format: None,
            })
            .build()?;
        let token = credentials.token().await?;
        assert_eq!(token.token, "federated-token");
        assert_eq!(token.token_type, "Bearer");
        Ok(())
    }

    #[tokio::test]
    async fn application_supplied() -> TestResult {
        let server = Server::run();
        expect_exchange(&server, "app-subject-token");

        let credentials = Builder::new()
            .with_audience(AUDIENCE)
            .with_subject_token_type(JWT_TOKEN_TYPE)
            .with_token_url(server.url_str("/v1/token"))
            .with_subject_token_provider(AppProvider { fail: false })
            .build()?;
        let token = credentials.token().await?;
        assert_eq!(token.token, "federated-token");
        Ok(())
    }

    #[tokio::test]
    async fn application_supplied_error() -> TestResult {
        let server = Server::run();
        let credentials = Builder::new()
            .with_audience(AUDIENCE)
            .with_subject_token_type(JWT_TOKEN_TYPE)
            .with_token_url(server.url_str("/v1/token"))
            .with_subject_token_provider(AppProvider { fail: true })
            .build()?;
        let err = credentials.token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(
            format!("{err:?}").contains("identity provider is unavailable"),
            "{err:?}"
        );
        Ok(())
    }

    #[test]
    fn invalid_configuration() {
        let err = Builder::from_json(json!({
            "type": "external_account",
            "subject_token_type": JWT_TOKEN_TYPE,
            "credential_source": {"file": "/var/run/token"}
        }))
        .build()
        .unwrap_err();
        assert!(err.is_missing_field(), "{err:?}");
    }
}
