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

//! Application-supplied AWS credentials.
//!
//! Applications running on AWS may already have credentials in a form this
//! crate cannot discover, e.g. via the AWS SDK. Implement
//! [AwsSecurityCredentialsProvider] and pass it to
//! [with_aws_security_credentials_provider][crate::credentials::external_account::Builder::with_aws_security_credentials_provider]
//! to sign the `GetCallerIdentity` request with them.

use crate::credentials::subject_token::{SubjectTokenProviderError, SupplierContext};
use std::future::Future;

/// A set of AWS credentials used to sign the subject token request.
#[derive(Clone, PartialEq)]
pub struct AwsSecurityCredentials {
    pub(crate) access_key_id: String,
    pub(crate) secret_access_key: String,
    pub(crate) session_token: Option<String>,
}

impl AwsSecurityCredentials {
    /// Creates long-lived credentials, without a session token.
    pub fn new<I, S>(access_key_id: I, secret_access_key: S) -> Self
    where
        I: Into<String>,
        S: Into<String>,
    {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Sets the session token of temporary credentials.
    pub fn with_session_token<T: Into<String>>(mut self, session_token: T) -> Self {
        let token = session_token.into();
        self.session_token = (!token.is_empty()).then_some(token);
        self
    }

    /// The AWS access key id.
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// The session token, if any.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

impl std::fmt::Debug for AwsSecurityCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecurityCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[censored]")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "[censored]"),
            )
            .finish()
    }
}

/// Supplies the AWS region and credentials used to create AWS subject tokens.
pub trait AwsSecurityCredentialsProvider: std::fmt::Debug + Send + Sync {
    /// The error type returned by the provider.
    type Error: SubjectTokenProviderError;

    /// Returns the AWS region, e.g. `us-east-2`.
    fn aws_region(
        &self,
        context: &SupplierContext,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send;

    /// Returns the AWS credentials.
    fn aws_security_credentials(
        &self,
        context: &SupplierContext,
    ) -> impl Future<Output = Result<AwsSecurityCredentials, Self::Error>> + Send;
}

pub(crate) mod dynamic {
    use super::{AwsSecurityCredentials, SupplierContext};
    use crate::Result;
    use crate::credentials::subject_token::SubjectTokenProviderError as _;
    use crate::errors::CredentialsError;

    /// A dyn-compatible, crate-private version of `AwsSecurityCredentialsProvider`.
    #[async_trait::async_trait]
    pub(crate) trait AwsSecurityCredentialsProvider: std::fmt::Debug + Send + Sync {
        async fn aws_region(&self, context: &SupplierContext) -> Result<String>;
        async fn aws_security_credentials(
            &self,
            context: &SupplierContext,
        ) -> Result<AwsSecurityCredentials>;
    }

    /// The public trait implements the dyn-compatible trait.
    #[async_trait::async_trait]
    impl<T> AwsSecurityCredentialsProvider for T
    where
        T: super::AwsSecurityCredentialsProvider,
    {
        async fn aws_region(&self, context: &SupplierContext) -> Result<String> {
            T::aws_region(self, context)
                .await
                .map_err(|e| CredentialsError::from_source(e.is_transient(), e))
        }

        async fn aws_security_credentials(
            &self,
            context: &SupplierContext,
        ) -> Result<AwsSecurityCredentials> {
            T::aws_security_credentials(self, context)
                .await
                .map_err(|e| CredentialsError::from_source(e.is_transient(), e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug() {
        let credentials =
            AwsSecurityCredentials::new("test-key-id", "test-secret").with_session_token("tok");
        let got = format!("{credentials:?}");
        assert!(got.contains("test-key-id"), "{got}");
        assert!(!got.contains("test-secret"), "{got}");
        assert!(!got.contains("tok\""), "{got}");
    }

    #[test]
    fn empty_session_token() {
        let credentials = AwsSecurityCredentials::new("id", "secret").with_session_token("");
        assert_eq!(credentials.session_token(), None);
        let credentials = credentials.with_session_token("test-token");
        assert_eq!(credentials.session_token(), Some("test-token"));
        assert_eq!(credentials.access_key_id(), "id");
    }
}
