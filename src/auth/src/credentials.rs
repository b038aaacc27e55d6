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
use crate::headers_util::build_bearer_headers;
use crate::token::{Token, TokenProvider};
use http::HeaderMap;
use std::sync::Arc;

pub mod aws;
pub mod external_account;
pub(crate) mod external_account_sources;
pub(crate) mod impersonated;
pub(crate) mod internal;
pub mod subject_token;

/// Represents a [Credentials] used to obtain auth tokens and the
/// corresponding request headers.
///
/// In general, [Credentials][credentials-link] are "digital object that
/// provide proof of identity", the archetype may be a username and password
/// combination, but a private RSA key may be a better example.
///
/// Modern authentication protocols do not send the credentials to
/// authenticate with a service. Even when sent over encrypted transports,
/// the credentials may be accidentally exposed via logging or may be
/// captured if there are errors in the transport encryption. Because the
/// credentials are often long-lived, that risk of exposure is also
/// long-lived.
///
/// Instead, modern authentication protocols exchange the credentials for a
/// time-limited [Token][token-link], a digital object that shows the caller
/// was in possession of the credentials. Because tokens are time limited,
/// risk of misuse is also time limited. Tokens may be further restricted to
/// only a certain subset of the RPCs in the service, or even to specific
/// resources, or only when used from a given machine (virtual or not).
/// Further limiting the risks associated with any leaks of these tokens.
///
/// Use [external_account::Builder] to create instances of this type.
///
/// [credentials-link]: https://cloud.google.com/docs/authentication#credentials
/// [token-link]: https://cloud.google.com/docs/authentication#token
#[derive(Clone, Debug)]
pub struct Credentials {
    // We use an `Arc` to hold the inner implementation.
    //
    // Credentials may be shared across threads (`Send + Sync`), so an `Rc`
    // will not do.
    //
    // They also need to derive `Clone`, as the HTTP clients which hold them
    // derive `Clone`. So a `Box` will not do.
    inner: Arc<dyn dynamic::CredentialsProvider>,
}

impl Credentials {
    pub(crate) fn new<T>(provider: T) -> Self
    where
        T: dynamic::CredentialsProvider + 'static,
    {
        Self {
            inner: Arc::new(provider),
        }
    }

    /// Asynchronously retrieves a token.
    ///
    /// Returns a [Token] for the current credentials. The underlying
    /// implementation refreshes the token as needed.
    pub async fn token(&self) -> Result<Token> {
        self.inner.token().await
    }

    /// Asynchronously constructs the auth headers.
    ///
    /// Different auth tokens are sent via different headers. The
    /// [Credentials] constructs the headers (and header values) that should
    /// be sent with a request.
    ///
    /// The headers include the `authorization` header, the quota project
    /// (if configured), and the trust boundary (if one applies to the
    /// token).
    pub async fn headers(&self) -> Result<HeaderMap> {
        self.inner.headers().await
    }
}

pub(crate) mod dynamic {
    use super::Result;
    use super::Token;
    use http::HeaderMap;

    /// A dyn-compatible, crate-private version of the credentials behavior.
    #[async_trait::async_trait]
    pub(crate) trait CredentialsProvider: std::fmt::Debug + Send + Sync {
        /// Asynchronously retrieves a token.
        async fn token(&self) -> Result<Token>;

        /// Asynchronously constructs the auth headers.
        async fn headers(&self) -> Result<HeaderMap>;
    }
}

/// The [Credentials] implementation shared by all credential sources.
///
/// The token provider does the heavy lifting: subject token retrieval, token
/// exchange, impersonation, caching, and trust boundaries are all layered
/// into `T`.
#[derive(Debug)]
pub(crate) struct TokenCredentials<T>
where
    T: TokenProvider,
{
    pub(crate) token_provider: T,
    pub(crate) quota_project_id: Option<String>,
}

#[async_trait::async_trait]
impl<T> dynamic::CredentialsProvider for TokenCredentials<T>
where
    T: TokenProvider,
{
    async fn token(&self) -> Result<Token> {
        self.token_provider.token().await
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let token = self.token_provider.token().await?;
        build_bearer_headers(&token, &self.quota_project_id)
    }
}
