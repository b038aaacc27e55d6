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

//! Application-supplied subject tokens.
//!
//! Some applications obtain the third-party token in ways this crate cannot
//! anticipate, e.g., via an SDK for their identity provider. Implement
//! [SubjectTokenProvider] and pass it to
//! [with_subject_token_provider][crate::credentials::external_account::Builder::with_subject_token_provider]
//! to use such tokens.

use std::error::Error;
use std::future::Future;

/// The information available to a [SubjectTokenProvider].
#[derive(Clone, Debug, PartialEq)]
pub struct SupplierContext {
    audience: String,
    subject_token_type: String,
}

impl SupplierContext {
    pub(crate) fn new<A, T>(audience: A, subject_token_type: T) -> Self
    where
        A: Into<String>,
        T: Into<String>,
    {
        Self {
            audience: audience.into(),
            subject_token_type: subject_token_type.into(),
        }
    }

    /// The workload or workforce pool provider the token is exchanged for.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// The type of the token the provider must return, e.g.
    /// `urn:ietf:params:oauth:token-type:jwt`.
    pub fn subject_token_type(&self) -> &str {
        &self.subject_token_type
    }
}

/// The errors returned by a [SubjectTokenProvider].
///
/// The credentials use [is_transient][SubjectTokenProviderError::is_transient]
/// to decide if the failure can be retried.
pub trait SubjectTokenProviderError: Error + Send + Sync + 'static {
    /// Returns `true` if the failure may succeed in future attempts.
    fn is_transient(&self) -> bool;
}

/// Supplies third-party subject tokens.
///
/// # Example
/// ```
/// # use google_cloud_auth_external_account::credentials::subject_token::*;
/// #[derive(Debug)]
/// struct MyTokenProvider;
///
/// #[derive(Debug)]
/// struct MyProviderError;
/// impl std::fmt::Display for MyProviderError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "MyProviderError")
///     }
/// }
/// impl std::error::Error for MyProviderError {}
/// impl SubjectTokenProviderError for MyProviderError {
///     fn is_transient(&self) -> bool { false }
/// }
///
/// impl SubjectTokenProvider for MyTokenProvider {
///     type Error = MyProviderError;
///     async fn subject_token(&self, context: &SupplierContext) -> Result<String, Self::Error> {
///         // Fetch a token for `context.audience()` from your identity provider.
///         Ok("my-subject-token".to_string())
///     }
/// }
/// ```
pub trait SubjectTokenProvider: std::fmt::Debug + Send + Sync {
    /// The error type returned by the provider.
    type Error: SubjectTokenProviderError;

    /// Returns a subject token for the given context.
    fn subject_token(
        &self,
        context: &SupplierContext,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send;
}

pub(crate) mod dynamic {
    use super::{SubjectTokenProviderError, SupplierContext};
    use crate::Result;
    use crate::errors::CredentialsError;

    /// A source of subject tokens.
    ///
    /// Each kind of credential source (file, URL, executable, etc.)
    /// implements this trait.
    #[async_trait::async_trait]
    pub(crate) trait SubjectTokenSource: std::fmt::Debug + Send + Sync {
        /// Returns the subject token, to be exchanged at the STS.
        async fn subject_token(&self) -> Result<String>;

        /// The name of the source, reported in the `x-goog-api-client`
        /// header.
        fn provider_type(&self) -> &'static str;
    }

    #[async_trait::async_trait]
    impl<T> SubjectTokenSource for std::sync::Arc<T>
    where
        T: SubjectTokenSource + ?Sized,
    {
        async fn subject_token(&self) -> Result<String> {
            T::subject_token(self).await
        }

        fn provider_type(&self) -> &'static str {
            T::provider_type(self)
        }
    }

    /// A dyn-compatible, crate-private version of `SubjectTokenProvider`.
    #[async_trait::async_trait]
    pub(crate) trait SubjectTokenProvider: std::fmt::Debug + Send + Sync {
        async fn subject_token(&self, context: &SupplierContext) -> Result<String>;
    }

    /// The public trait implements the dyn-compatible trait.
    #[async_trait::async_trait]
    impl<T> SubjectTokenProvider for T
    where
        T: super::SubjectTokenProvider,
    {
        async fn subject_token(&self, context: &SupplierContext) -> Result<String> {
            T::subject_token(self, context)
                .await
                .map_err(|e| CredentialsError::from_source(e.is_transient(), e))
        }
    }
}
