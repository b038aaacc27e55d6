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

use crate::Result;
use crate::credentials::subject_token::SupplierContext;
use crate::credentials::subject_token::dynamic::{SubjectTokenProvider, SubjectTokenSource};
use std::sync::Arc;

/// Subject tokens supplied by the application.
#[derive(Debug, Clone)]
pub(crate) struct ProgrammaticSourcedCredentials {
    subject_token_provider: Arc<dyn SubjectTokenProvider>,
    context: SupplierContext,
}

impl ProgrammaticSourcedCredentials {
    pub(crate) fn new(
        subject_token_provider: Arc<dyn SubjectTokenProvider>,
        context: SupplierContext,
    ) -> Self {
        Self {
            subject_token_provider,
            context,
        }
    }
}

#[async_trait::async_trait]
impl SubjectTokenSource for ProgrammaticSourcedCredentials {
    async fn subject_token(&self) -> Result<String> {
        self.subject_token_provider
            .subject_token(&self.context)
            .await
    }

    fn provider_type(&self) -> &'static str {
        "programmatic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::subject_token::{self, SubjectTokenProviderError};
    use std::fmt;

    #[derive(Debug)]
    struct TestError;
    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test-only error")
        }
    }
    impl std::error::Error for TestError {}
    impl SubjectTokenProviderError for TestError {
        fn is_transient(&self) -> bool {
            true
        }
    }

    #[derive(Debug)]
    struct TestProvider(bool);
    impl subject_token::SubjectTokenProvider for TestProvider {
        type Error = TestError;
        async fn subject_token(&self, context: &SupplierContext) -> std::result::Result<String, TestError> {
            if self.0 {
                return Err(TestError);
            }
            Ok(format!("token-for-{}", context.audience()))
        }
    }

    #[tokio::test]
    async fn subject_token() -> anyhow::Result<()> {
        let source = ProgrammaticSourcedCredentials::new(
            Arc::new(TestProvider(false)),
            SupplierContext::new("test-audience", "test-type"),
        );
        let token = source.subject_token().await?;
        assert_eq!(token, "token-for-test-audience");
        assert_eq!(source.provider_type(), "programmatic");
        Ok(())
    }

    #[tokio::test]
    async fn subject_token_error() {
        let source = ProgrammaticSourcedCredentials::new(
            Arc::new(TestProvider(true)),
            SupplierContext::new("test-audience", "test-type"),
        );
        let err = source.subject_token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("test-only error"), "{err}");
    }
}
