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

//! [Workload Identity Federation] and [Workforce Identity Federation]
//! credentials.
//!
//! External account credentials exchange a token issued by a third-party
//! identity provider (the "subject token") for a Google Cloud access token,
//! using the [Security Token Service]. The subject token may come from a
//! file, a URL, a local executable, the AWS environment, an X.509 workload
//! certificate, or the application itself.
//!
//! Optionally, the federated token is used to impersonate a service account,
//! and the resulting token is used instead.
//!
//! ## Example: Creating credentials from a JSON object
//!
//! ```no_run
//! # use google_cloud_auth_external_account::credentials::external_account::Builder;
//! # use serde_json::json;
//! #
//! # tokio_test::block_on(async {
//! let config = json!({
//!     "type": "external_account",
//!     "audience": "//iam.googleapis.com/projects/123/locations/global/workloadIdentityPools/my-pool/providers/my-provider",
//!     "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
//!     "token_url": "https://sts.googleapis.com/v1/token",
//!     "credential_source": {
//!         "url": "http://169.254.169.254/token",
//!         "headers": {"Metadata": "True"},
//!         "format": {"type": "json", "subject_token_field_name": "access_token"}
//!     }
//! });
//! let credentials = Builder::from_json(config).build()?;
//! let headers = credentials.headers().await?;
//! println!("Headers: {headers:?}");
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! ## Example: Supplying subject tokens from the application
//!
//! ```no_run
//! # use google_cloud_auth_external_account::credentials::external_account::Builder;
//! # use google_cloud_auth_external_account::credentials::subject_token::*;
//! # #[derive(Debug)]
//! # struct MyProviderError;
//! # impl std::fmt::Display for MyProviderError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//! #         write!(f, "MyProviderError")
//! #     }
//! # }
//! # impl std::error::Error for MyProviderError {}
//! # impl SubjectTokenProviderError for MyProviderError {
//! #     fn is_transient(&self) -> bool { false }
//! # }
//! #[derive(Debug)]
//! struct MyTokenProvider;
//!
//! impl SubjectTokenProvider for MyTokenProvider {
//!     type Error = MyProviderError;
//!     async fn subject_token(&self, _context: &SupplierContext) -> Result<String, Self::Error> {
//!         Ok("my-subject-token".to_string())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let credentials = Builder::new()
//!     .with_audience("//iam.googleapis.com/locations/global/workforcePools/my-pool/providers/my-provider")
//!     .with_subject_token_type("urn:ietf:params:oauth:token-type:id_token")
//!     .with_workforce_pool_user_project("my-project")
//!     .with_subject_token_provider(MyTokenProvider)
//!     .build()?;
//! let token = credentials.token().await?;
//! println!("Token type: {}", token.token_type);
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! [Workload Identity Federation]: https://cloud.google.com/iam/docs/workload-identity-federation
//! [Workforce Identity Federation]: https://cloud.google.com/iam/docs/workforce-identity-federation
//! [Security Token Service]: https://cloud.google.com/iam/docs/reference/sts/rest

use super::aws::AwsSecurityCredentialsProvider;
use super::aws::dynamic::AwsSecurityCredentialsProvider as DynAwsSecurityCredentialsProvider;
use super::external_account_sources::SubjectTokenFormat;
use super::external_account_sources::aws_sourced::{AwsMetadataEndpoints, AwsSourcedCredentials};
use super::external_account_sources::executable_sourced::ExecutableSourcedCredentials;
use super::external_account_sources::file_sourced::FileSourcedCredentials;
use super::external_account_sources::programmatic_sourced::ProgrammaticSourcedCredentials;
use super::external_account_sources::url_sourced::UrlSourcedCredentials;
use super::external_account_sources::x509_sourced::X509SourcedCredentials;
use super::impersonated::{self, DEFAULT_LIFETIME, ImpersonatedTokenProvider};
use super::internal::sts_exchange::{
    ClientAuthStyle, ClientAuthentication, ExchangeTokenRequest, STSHandler,
};
use super::subject_token::dynamic::{
    SubjectTokenProvider as DynSubjectTokenProvider, SubjectTokenSource,
};
use super::subject_token::{SubjectTokenProvider, SupplierContext};
use super::{Credentials, TokenCredentials};
use crate::build_errors::Error as BuilderError;
use crate::constants::{DEFAULT_SCOPE, DEFAULT_UNIVERSE_DOMAIN};
use crate::headers_util::{X_GOOG_API_CLIENT, metrics_header_value};
use crate::token::{Token, TokenProvider};
use crate::token_cache::TokenCache;
use crate::trust_boundary::{self, ExternalAccountConfig, ServiceAccountConfig};
use crate::{BuildResult, Result};
use http::{HeaderMap, HeaderValue};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::time::{Duration, Instant};

const EXTERNAL_ACCOUNT_TYPE: &str = "external_account";
const WORKFORCE_AUDIENCE_PATTERN: &str = r"//iam\.googleapis\.com/locations/[^/]+/workforcePools/";
const MIN_LIFETIME: Duration = Duration::from_secs(600);
const MAX_LIFETIME: Duration = Duration::from_secs(43200);

/// How to extract the subject token from a file or URL response.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CredentialSourceFormat {
    /// Either `text` (the default) or `json`.
    #[serde(rename = "type")]
    pub format_type: Option<String>,
    /// The field containing the subject token, required for `json`.
    pub subject_token_field_name: Option<String>,
}

impl TryFrom<Option<CredentialSourceFormat>> for SubjectTokenFormat {
    type Error = BuilderError;

    fn try_from(format: Option<CredentialSourceFormat>) -> BuildResult<Self> {
        let Some(format) = format else {
            return Ok(Self::Text);
        };
        match format.format_type.as_deref() {
            None | Some("text") => Ok(Self::Text),
            Some("json") => match format.subject_token_field_name {
                Some(field_name) if !field_name.is_empty() => Ok(Self::Json { field_name }),
                _ => Err(BuilderError::invalid_config(
                    "`subject_token_field_name` is required for the `json` format",
                )),
            },
            Some(other) => Err(BuilderError::unknown_type(format!(
                "invalid credential source format `{other}`"
            ))),
        }
    }
}

/// The configuration for executable-sourced credentials.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ExecutableConfig {
    /// The command to run, including its arguments.
    pub command: String,
    /// How long to wait for the command, 30 seconds if unset.
    pub timeout_millis: Option<u32>,
    /// Where the executable caches its responses.
    pub output_file: Option<String>,
}

/// The configuration for X.509 certificate-sourced credentials.
///
/// Exactly one of the fields must be set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CertificateConfig {
    /// Use the certificate configuration at the well-known location.
    pub use_default_certificate_config: Option<bool>,
    /// The path of the certificate configuration.
    pub certificate_config_location: Option<String>,
}

/// Where to find the subject token.
///
/// This corresponds to the `credential_source` field in an external account
/// configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CredentialSource {
    /// The AWS environment or instance metadata.
    Aws {
        /// Must be `aws1`.
        environment_id: String,
        region_url: Option<String>,
        url: Option<String>,
        regional_cred_verification_url: Option<String>,
        imdsv2_session_token_url: Option<String>,
    },
    /// The output of a local command.
    Executable { executable: ExecutableConfig },
    /// An X.509 workload certificate, presented via mTLS.
    X509 { certificate: CertificateConfig },
    /// A local file.
    File {
        file: String,
        format: Option<CredentialSourceFormat>,
    },
    /// An HTTP(S) endpoint.
    Url {
        url: String,
        headers: Option<HashMap<String, String>>,
        format: Option<CredentialSourceFormat>,
    },
}

/// The `service_account_impersonation` field of the configuration file.
#[derive(Debug, Deserialize)]
struct ImpersonationOptions {
    token_lifetime_seconds: Option<u64>,
}

/// A representation of an [external account configuration file].
///
/// [external account configuration file]: https://google.aip.dev/auth/4117#configuration-file-generation-and-usage
#[derive(Debug, Deserialize)]
struct ExternalAccountFile {
    #[serde(rename = "type")]
    file_type: Option<String>,
    audience: Option<String>,
    subject_token_type: Option<String>,
    token_url: Option<String>,
    service_account_impersonation_url: Option<String>,
    service_account_impersonation: Option<ImpersonationOptions>,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Option<Vec<String>>,
    workforce_pool_user_project: Option<String>,
    universe_domain: Option<String>,
    quota_project_id: Option<String>,
    credential_source: Option<CredentialSource>,
}

/// A builder for external account [Credentials].
///
/// The subject token comes from exactly one of:
/// - a [CredentialSource], typically loaded from a configuration file,
/// - a [SubjectTokenProvider] implemented by the application,
/// - an [AwsSecurityCredentialsProvider] implemented by the application.
///
/// # Example
/// ```
/// # use google_cloud_auth_external_account::credentials::external_account::Builder;
/// let config = serde_json::json!({
///     "type": "external_account",
///     "audience": "//iam.googleapis.com/projects/123/locations/global/workloadIdentityPools/my-pool/providers/my-provider",
///     "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
///     "credential_source": {
///         "url": "http://169.254.169.254/metadata/identity/oauth2/token",
///         "headers": { "Metadata": "True" },
///         "format": { "type": "json", "subject_token_field_name": "access_token" }
///     }
/// });
/// let credentials = Builder::from_json(config)
///     .with_quota_project_id("my-quota-project")
///     .build();
/// assert!(credentials.is_ok());
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    audience: Option<String>,
    subject_token_type: Option<String>,
    token_url: Option<String>,
    service_account_impersonation_url: Option<String>,
    service_account_impersonation_lifetime: Option<Duration>,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Option<Vec<String>>,
    workforce_pool_user_project: Option<String>,
    universe_domain: Option<String>,
    quota_project_id: Option<String>,
    credential_source: Option<CredentialSource>,
    subject_token_provider: Option<Arc<dyn DynSubjectTokenProvider>>,
    aws_security_credentials_provider: Option<Arc<dyn DynAwsSecurityCredentialsProvider>>,
    error: Option<BuilderError>,
}

impl Builder {
    /// Creates an empty builder.
    ///
    /// At least the audience, the subject token type, and one source of
    /// subject tokens must be configured before calling [Builder::build].
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder from the contents of an [external account
    /// configuration file].
    ///
    /// Errors in the configuration are reported by [Builder::build].
    ///
    /// [external account configuration file]: https://google.aip.dev/auth/4117#configuration-file-generation-and-usage
    pub fn from_json(config: Value) -> Self {
        let file = match serde_json::from_value::<ExternalAccountFile>(config) {
            Ok(f) => f,
            Err(e) => {
                return Self {
                    error: Some(BuilderError::parsing(e)),
                    ..Self::default()
                };
            }
        };
        if let Some(t) = file.file_type.filter(|t| t != EXTERNAL_ACCOUNT_TYPE) {
            return Self {
                error: Some(BuilderError::unknown_type(format!(
                    "expected an `{EXTERNAL_ACCOUNT_TYPE}` configuration, got `{t}`"
                ))),
                ..Self::default()
            };
        }
        Self {
            audience: file.audience,
            subject_token_type: file.subject_token_type,
            token_url: file.token_url,
            service_account_impersonation_url: file.service_account_impersonation_url,
            service_account_impersonation_lifetime: file
                .service_account_impersonation
                .and_then(|o| o.token_lifetime_seconds)
                .map(Duration::from_secs),
            client_id: file.client_id,
            client_secret: file.client_secret,
            scopes: file.scopes.filter(|s| !s.is_empty()),
            workforce_pool_user_project: file.workforce_pool_user_project,
            universe_domain: file.universe_domain,
            quota_project_id: file.quota_project_id,
            credential_source: file.credential_source,
            ..Self::default()
        }
    }

    /// Sets the audience, the resource name of the workload or workforce
    /// identity pool provider.
    pub fn with_audience<S: Into<String>>(mut self, audience: S) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Sets the type of the subject token, e.g.
    /// `urn:ietf:params:oauth:token-type:jwt`.
    pub fn with_subject_token_type<S: Into<String>>(mut self, subject_token_type: S) -> Self {
        self.subject_token_type = Some(subject_token_type.into());
        self
    }

    /// Overrides the Security Token Service endpoint.
    ///
    /// Defaults to `https://sts.{universe_domain}/v1/token`.
    pub fn with_token_url<S: Into<String>>(mut self, token_url: S) -> Self {
        self.token_url = Some(token_url.into());
        self
    }

    /// Impersonates a service account using the federated token.
    ///
    /// The URL has the form
    /// `https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{email}:generateAccessToken`.
    pub fn with_service_account_impersonation_url<S: Into<String>>(mut self, url: S) -> Self {
        self.service_account_impersonation_url = Some(url.into());
        self
    }

    /// Sets the lifetime of the impersonated access tokens.
    ///
    /// Must be between 10 minutes and 12 hours. Defaults to 1 hour.
    pub fn with_service_account_impersonation_lifetime(mut self, lifetime: Duration) -> Self {
        self.service_account_impersonation_lifetime = Some(lifetime);
        self
    }

    /// Sets the OAuth client id, used to authenticate with the Security Token
    /// Service.
    pub fn with_client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the OAuth client secret.
    pub fn with_client_secret<S: Into<String>>(mut self, client_secret: S) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Overrides the [scopes] for these credentials.
    ///
    /// By default `https://www.googleapis.com/auth/cloud-platform` is used.
    ///
    /// [scopes]: https://developers.google.com/identity/protocols/oauth2/scopes
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the project billed for workforce pool requests.
    ///
    /// Only valid with workforce pool audiences.
    pub fn with_workforce_pool_user_project<S: Into<String>>(mut self, project: S) -> Self {
        self.workforce_pool_user_project = Some(project.into());
        self
    }

    /// Sets the universe domain, `googleapis.com` by default.
    pub fn with_universe_domain<S: Into<String>>(mut self, universe_domain: S) -> Self {
        self.universe_domain = Some(universe_domain.into());
        self
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Sets where to find the subject token.
    pub fn with_credential_source(mut self, source: CredentialSource) -> Self {
        self.credential_source = Some(source);
        self
    }

    /// Uses subject tokens supplied by the application.
    pub fn with_subject_token_provider<T>(mut self, provider: T) -> Self
    where
        T: SubjectTokenProvider + 'static,
    {
        self.subject_token_provider = Some(Arc::new(provider));
        self
    }

    /// Creates AWS subject tokens from credentials supplied by the
    /// application.
    pub fn with_aws_security_credentials_provider<T>(mut self, provider: T) -> Self
    where
        T: AwsSecurityCredentialsProvider + 'static,
    {
        self.aws_security_credentials_provider = Some(Arc::new(provider));
        self
    }

    /// Returns a [Credentials] instance with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is incomplete or inconsistent,
    /// e.g. a required field is missing, more than one source of subject
    /// tokens is configured, or the credential source is invalid.
    pub fn build(self) -> BuildResult<Credentials> {
        self.build_with_trust_boundary(*trust_boundary::ENABLED)
    }

    fn build_with_trust_boundary(self, trust_boundary_enabled: bool) -> BuildResult<Credentials> {
        let quota_project_id = self.quota_project_id.clone();
        let config = self.validate()?;
        let token_provider = config.token_provider(trust_boundary_enabled)?;
        Ok(Credentials::new(TokenCredentials {
            token_provider: TokenCache::new(token_provider),
            quota_project_id,
        }))
    }

    fn validate(self) -> BuildResult<Config> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let audience = self
            .audience
            .filter(|a| !a.is_empty())
            .ok_or_else(|| BuilderError::missing_field("audience"))?;
        let subject_token_type = self
            .subject_token_type
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BuilderError::missing_field("subject_token_type"))?;

        let source = match (
            self.credential_source,
            self.subject_token_provider,
            self.aws_security_credentials_provider,
        ) {
            (Some(s), None, None) => SourceConfig::Descriptor(s),
            (None, Some(p), None) => SourceConfig::Supplier(p),
            (None, None, Some(p)) => SourceConfig::AwsSupplier(p),
            (None, None, None) => {
                return Err(BuilderError::invalid_config(
                    "one of a credential source, a subject token provider, or an AWS security credentials provider is required",
                ));
            }
            _ => {
                return Err(BuilderError::invalid_config(
                    "only one of a credential source, a subject token provider, or an AWS security credentials provider may be set",
                ));
            }
        };

        let workforce_pool_user_project = self.workforce_pool_user_project.filter(|p| !p.is_empty());
        if workforce_pool_user_project.is_some() && !is_workforce_pool(&audience) {
            return Err(BuilderError::invalid_config(
                "workforce_pool_user_project should not be set for non-workforce pool credentials",
            ));
        }

        let lifetime_configured = self.service_account_impersonation_lifetime.is_some();
        let lifetime = self
            .service_account_impersonation_lifetime
            .unwrap_or(DEFAULT_LIFETIME);
        if !(MIN_LIFETIME..=MAX_LIFETIME).contains(&lifetime) {
            return Err(BuilderError::invalid_config(format!(
                "invalid service account impersonation lifetime {}s, must be between {}s and {}s",
                lifetime.as_secs(),
                MIN_LIFETIME.as_secs(),
                MAX_LIFETIME.as_secs()
            )));
        }

        let universe_domain = self
            .universe_domain
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_UNIVERSE_DOMAIN.to_string());
        let token_url = self
            .token_url
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("https://sts.{universe_domain}/v1/token"));
        let scopes = self
            .scopes
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]);

        Ok(Config {
            audience,
            subject_token_type,
            token_url,
            service_account_impersonation_url: self
                .service_account_impersonation_url
                .filter(|u| !u.is_empty()),
            lifetime,
            lifetime_configured,
            client_id: self.client_id.filter(|c| !c.is_empty()),
            client_secret: self.client_secret,
            scopes,
            workforce_pool_user_project,
            universe_domain,
            source,
        })
    }
}

static WORKFORCE_AUDIENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(WORKFORCE_AUDIENCE_PATTERN).expect("workforce audience pattern is valid")
});

fn is_workforce_pool(audience: &str) -> bool {
    WORKFORCE_AUDIENCE.is_match(audience)
}

#[derive(Debug)]
enum SourceConfig {
    Descriptor(CredentialSource),
    Supplier(Arc<dyn DynSubjectTokenProvider>),
    AwsSupplier(Arc<dyn DynAwsSecurityCredentialsProvider>),
}

/// A validated configuration.
#[derive(Debug)]
struct Config {
    audience: String,
    subject_token_type: String,
    token_url: String,
    service_account_impersonation_url: Option<String>,
    lifetime: Duration,
    lifetime_configured: bool,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Vec<String>,
    workforce_pool_user_project: Option<String>,
    universe_domain: String,
    source: SourceConfig,
}

impl Config {
    /// Creates the subject token source, and the HTTP client used to call
    /// Google services.
    fn subject_token_source(&self) -> BuildResult<(Arc<dyn SubjectTokenSource>, reqwest::Client)> {
        let context = || SupplierContext::new(&self.audience, &self.subject_token_type);
        let source: Arc<dyn SubjectTokenSource> = match &self.source {
            SourceConfig::Supplier(p) => {
                Arc::new(ProgrammaticSourcedCredentials::new(p.clone(), context()))
            }
            SourceConfig::AwsSupplier(p) => Arc::new(AwsSourcedCredentials::from_provider(
                p.clone(),
                context(),
                None,
            )),
            SourceConfig::Descriptor(CredentialSource::X509 { certificate }) => {
                let source = X509SourcedCredentials::new(certificate)?;
                let client = source.client();
                let source: Arc<dyn SubjectTokenSource> = Arc::new(source);
                return Ok((source, client));
            }
            SourceConfig::Descriptor(CredentialSource::File { file, format }) => Arc::new(
                FileSourcedCredentials::new(file.clone(), format.clone().try_into()?),
            ),
            SourceConfig::Descriptor(CredentialSource::Url {
                url,
                headers,
                format,
            }) => Arc::new(UrlSourcedCredentials::new(
                url.clone(),
                headers.clone(),
                format.clone().try_into()?,
            )),
            SourceConfig::Descriptor(CredentialSource::Executable { executable }) => {
                Arc::new(ExecutableSourcedCredentials::new(
                    executable.clone(),
                    self.audience.clone(),
                    self.subject_token_type.clone(),
                    self.service_account_impersonation_url.clone(),
                )?)
            }
            SourceConfig::Descriptor(CredentialSource::Aws {
                environment_id,
                region_url,
                url,
                regional_cred_verification_url,
                imdsv2_session_token_url,
            }) => Arc::new(AwsSourcedCredentials::new(
                environment_id,
                AwsMetadataEndpoints {
                    region_url: region_url.clone(),
                    url: url.clone(),
                    imdsv2_session_token_url: imdsv2_session_token_url.clone(),
                },
                regional_cred_verification_url.clone(),
                self.audience.clone(),
            )?),
        };
        Ok((source, reqwest::Client::new()))
    }

    /// Layers the token exchange, impersonation, and trust boundaries.
    ///
    /// The caller adds the outermost cache.
    fn token_provider(self, trust_boundary_enabled: bool) -> BuildResult<Arc<dyn TokenProvider>> {
        let (source, client) = self.subject_token_source()?;
        let metrics_header = metrics_header_value(
            source.provider_type(),
            self.service_account_impersonation_url.is_some(),
            self.lifetime_configured,
        );
        let exchange_scopes = if self.service_account_impersonation_url.is_some() {
            vec![DEFAULT_SCOPE.to_string()]
        } else {
            self.scopes.clone()
        };
        let exchange = ExternalAccountTokenProvider {
            source,
            audience: self.audience.clone(),
            subject_token_type: self.subject_token_type,
            token_url: self.token_url,
            client_id: self.client_id,
            client_secret: self.client_secret,
            scopes: exchange_scopes,
            workforce_pool_user_project: self.workforce_pool_user_project,
            metrics_header: metrics_header.clone(),
            client: client.clone(),
        };

        let provider: Arc<dyn TokenProvider> = match &self.service_account_impersonation_url {
            None => Arc::new(exchange),
            Some(url) => Arc::new(ImpersonatedTokenProvider {
                source: TokenCache::new(exchange),
                service_account_impersonation_url: url.clone(),
                delegates: Vec::new(),
                scopes: self.scopes,
                lifetime: self.lifetime,
                metrics_header,
                client,
            }),
        };
        if !trust_boundary_enabled {
            return Ok(provider);
        }

        let email = self
            .service_account_impersonation_url
            .as_deref()
            .and_then(impersonated::service_account_email);
        let provider: Arc<dyn TokenProvider> = match email {
            Some(email) => Arc::new(trust_boundary::TrustBoundaryTokenProvider::new(
                provider,
                ServiceAccountConfig::new(email, self.universe_domain),
            )),
            None => Arc::new(trust_boundary::TrustBoundaryTokenProvider::new(
                provider,
                ExternalAccountConfig::new(self.audience, self.universe_domain),
            )),
        };
        Ok(provider)
    }
}

/// Exchanges subject tokens for federated access tokens.
#[derive(Debug)]
struct ExternalAccountTokenProvider {
    source: Arc<dyn SubjectTokenSource>,
    audience: String,
    subject_token_type: String,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Vec<String>,
    workforce_pool_user_project: Option<String>,
    metrics_header: String,
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl TokenProvider for ExternalAccountTokenProvider {
    async fn token(&self) -> Result<Token> {
        let subject_token = self.source.subject_token().await?;

        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&self.metrics_header) {
            headers.insert(X_GOOG_API_CLIENT, v);
        }
        // The user project is only needed when the client is not
        // authenticated. Otherwise the client project is billed.
        let extra_options = match (&self.workforce_pool_user_project, &self.client_id) {
            (Some(project), None) => Some(HashMap::from([(
                "userProject".to_string(),
                project.clone(),
            )])),
            _ => None,
        };
        let req = ExchangeTokenRequest {
            url: self.token_url.clone(),
            authentication: ClientAuthentication {
                auth_style: ClientAuthStyle::InHeader,
                client_id: self.client_id.clone(),
                client_secret: self.client_secret.clone(),
            },
            headers,
            subject_token,
            subject_token_type: self.subject_token_type.clone(),
            audience: Some(self.audience.clone()),
            scope: self.scopes.clone(),
            extra_options,
        };
        let token_res = STSHandler::exchange_token(&self.client, req).await?;

        let expires_in = u64::try_from(token_res.expires_in).unwrap_or_default();
        Ok(Token {
            token: token_res.access_token,
            token_type: token_res.token_type,
            expires_at: Some(Instant::now() + Duration::from_secs(expires_in)),
            metadata: None,
        })
    }
}
