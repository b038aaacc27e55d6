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

//! AWS-sourced subject tokens.
//!
//! The subject token is a serialized, signed `GetCallerIdentity` request.
//! The Security Token Service replays the request to verify the caller's
//! AWS identity. The AWS credentials and region come from the environment,
//! the EC2 metadata server, or an application-supplied provider.

use crate::build_errors::Error as BuilderError;
use crate::credentials::aws::AwsSecurityCredentials;
use crate::credentials::aws::dynamic::AwsSecurityCredentialsProvider;
use crate::credentials::internal::aws_signer::{AwsRequestSigner, query_escape};
use crate::credentials::subject_token::SupplierContext;
use crate::credentials::subject_token::dynamic::SubjectTokenSource;
use crate::errors::{self, CredentialsError};
use crate::{BuildResult, Result};
use http::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use url::Url;

pub(crate) const DEFAULT_REGIONAL_CRED_VERIFICATION_URL: &str =
    "https://sts.{region}.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15";
const SUPPORTED_VERSION: &str = "1";

const X_GOOG_CLOUD_TARGET_RESOURCE: &str = "x-goog-cloud-target-resource";
const IMDSV2_SESSION_TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const IMDSV2_SESSION_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const IMDSV2_SESSION_TTL: &str = "21600";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

const AWS_REGION: &str = "AWS_REGION";
const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// The subject token, before encoding.
#[derive(Debug, Serialize)]
struct AwsRequest {
    url: String,
    method: &'static str,
    headers: Vec<AwsRequestHeader>,
}

#[derive(Debug, Serialize)]
struct AwsRequestHeader {
    key: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataCredentials {
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    token: Option<String>,
}

/// The metadata server endpoints, from the credential source.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct AwsMetadataEndpoints {
    pub region_url: Option<String>,
    pub url: Option<String>,
    pub imdsv2_session_token_url: Option<String>,
}

#[derive(Debug)]
enum Source {
    Metadata(AwsMetadataEndpoints),
    Programmatic {
        provider: Arc<dyn AwsSecurityCredentialsProvider>,
        context: SupplierContext,
    },
}

#[derive(Debug)]
pub(crate) struct AwsSourcedCredentials {
    audience: String,
    regional_cred_verification_url: String,
    source: Source,
    client: Client,
}

impl AwsSourcedCredentials {
    /// Creates a source using the environment and the metadata server.
    ///
    /// `environment_id` must be `aws1`.
    pub(crate) fn new(
        environment_id: &str,
        endpoints: AwsMetadataEndpoints,
        regional_cred_verification_url: Option<String>,
        audience: String,
    ) -> BuildResult<Self> {
        let Some(version) = environment_id.strip_prefix("aws") else {
            return Err(BuilderError::unknown_type(format!(
                "invalid environment id `{environment_id}`"
            )));
        };
        if version != SUPPORTED_VERSION {
            return Err(BuilderError::not_supported(format!(
                "aws version '{version}' is not supported"
            )));
        }
        Ok(Self {
            audience,
            regional_cred_verification_url: verification_url(regional_cred_verification_url),
            source: Source::Metadata(endpoints),
            client: Client::new(),
        })
    }

    /// Creates a source using application-supplied AWS credentials.
    pub(crate) fn from_provider(
        provider: Arc<dyn AwsSecurityCredentialsProvider>,
        context: SupplierContext,
        regional_cred_verification_url: Option<String>,
    ) -> Self {
        Self {
            audience: context.audience().to_string(),
            regional_cred_verification_url: verification_url(regional_cred_verification_url),
            source: Source::Programmatic { provider, context },
            client: Client::new(),
        }
    }

    async fn subject_token_at(&self, now: OffsetDateTime) -> Result<String> {
        let (region, credentials) = match &self.source {
            Source::Programmatic { provider, context } => (
                provider.aws_region(context).await?,
                provider.aws_security_credentials(context).await?,
            ),
            Source::Metadata(endpoints) => self.from_environment(endpoints).await?,
        };

        let url = self.regional_cred_verification_url.replace("{region}", &region);
        let parsed = Url::parse(&url).map_err(errors::non_retryable)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(X_GOOG_CLOUD_TARGET_RESOURCE),
            HeaderValue::from_str(&self.audience).map_err(errors::non_retryable)?,
        );
        let signed = AwsRequestSigner::new(region, credentials).sign(
            "POST",
            &parsed,
            &headers,
            &[],
            now,
        )?;

        let mut headers = signed
            .iter()
            .map(|(name, value)| {
                Ok(AwsRequestHeader {
                    key: canonical_header_key(name.as_str()),
                    value: value.to_str().map_err(errors::non_retryable)?.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        headers.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.value.cmp(&b.value)));

        let request = AwsRequest {
            url,
            method: "POST",
            headers,
        };
        let json = serde_json::to_string(&request).map_err(errors::non_retryable)?;
        Ok(query_escape(&json))
    }

    async fn from_environment(
        &self,
        endpoints: &AwsMetadataEndpoints,
    ) -> Result<(String, AwsSecurityCredentials)> {
        let env_region = getenv(AWS_REGION).or_else(|| getenv(AWS_DEFAULT_REGION));
        let env_credentials = match (getenv(AWS_ACCESS_KEY_ID), getenv(AWS_SECRET_ACCESS_KEY)) {
            (Some(id), Some(secret)) => {
                let credentials = AwsSecurityCredentials::new(id, secret);
                Some(match getenv(AWS_SESSION_TOKEN) {
                    Some(token) => credentials.with_session_token(token),
                    None => credentials,
                })
            }
            _ => None,
        };

        let session_token = match (&env_region, &env_credentials) {
            (Some(_), Some(_)) => None,
            _ => self.imdsv2_session_token(endpoints).await?,
        };
        let region = match env_region {
            Some(region) => region,
            None => self.region(endpoints, &session_token).await?,
        };
        let credentials = match env_credentials {
            Some(credentials) => credentials,
            None => self.security_credentials(endpoints, &session_token).await?,
        };
        Ok((region, credentials))
    }

    async fn imdsv2_session_token(&self, endpoints: &AwsMetadataEndpoints) -> Result<Option<String>> {
        let Some(url) = &endpoints.imdsv2_session_token_url else {
            return Ok(None);
        };
        let request = self
            .client
            .put(url)
            .header(IMDSV2_SESSION_TTL_HEADER, IMDSV2_SESSION_TTL);
        let token = metadata_text(request, "unable to retrieve AWS session token").await?;
        Ok(Some(token))
    }

    fn metadata_get(&self, url: &str, session_token: &Option<String>) -> RequestBuilder {
        let request = self.client.get(url);
        match session_token {
            Some(token) => request.header(IMDSV2_SESSION_TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn region(
        &self,
        endpoints: &AwsMetadataEndpoints,
        session_token: &Option<String>,
    ) -> Result<String> {
        let Some(url) = &endpoints.region_url else {
            return Err(errors::non_retryable_from_str(
                "unable to determine AWS region",
            ));
        };
        let zone = metadata_text(
            self.metadata_get(url, session_token),
            "unable to retrieve AWS region",
        )
        .await?;
        // The metadata server returns the availability zone, e.g.
        // `us-east-2b`; the region drops the last character.
        let mut region = zone.trim().to_string();
        if region.pop().is_none() || region.is_empty() {
            return Err(errors::non_retryable_from_str(format!(
                "invalid AWS availability zone `{zone}`"
            )));
        }
        Ok(region)
    }

    async fn security_credentials(
        &self,
        endpoints: &AwsMetadataEndpoints,
        session_token: &Option<String>,
    ) -> Result<AwsSecurityCredentials> {
        let Some(url) = &endpoints.url else {
            return Err(errors::non_retryable_from_str(
                "unable to determine the AWS metadata server security credentials endpoint",
            ));
        };
        let role = metadata_text(
            self.metadata_get(url, session_token),
            "unable to retrieve AWS role name",
        )
        .await?;
        let body = metadata_text(
            self.metadata_get(&format!("{url}/{}", role.trim()), session_token),
            "unable to retrieve AWS security credentials",
        )
        .await?;
        let response: MetadataCredentials =
            serde_json::from_str(&body).map_err(errors::non_retryable)?;

        let access_key_id = response
            .access_key_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| errors::non_retryable_from_str("missing AccessKeyId credential"))?;
        let secret_access_key = response
            .secret_access_key
            .filter(|v| !v.is_empty())
            .ok_or_else(|| errors::non_retryable_from_str("missing SecretAccessKey credential"))?;
        let credentials = AwsSecurityCredentials::new(access_key_id, secret_access_key);
        Ok(match response.token {
            Some(token) => credentials.with_session_token(token),
            None => credentials,
        })
    }
}

#[async_trait::async_trait]
impl SubjectTokenSource for AwsSourcedCredentials {
    async fn subject_token(&self) -> Result<String> {
        self.subject_token_at(OffsetDateTime::now_utc()).await
    }

    fn provider_type(&self) -> &'static str {
        match self.source {
            Source::Metadata(_) => "aws",
            Source::Programmatic { .. } => "programmatic",
        }
    }
}

fn verification_url(url: Option<String>) -> String {
    url.filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_REGIONAL_CRED_VERIFICATION_URL.to_string())
}

fn getenv(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Converts `x-amz-date` into `X-Amz-Date`.
fn canonical_header_key(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Sends a metadata request and returns the response body.
///
/// Unsuccessful responses produce `{msg} - {body}`.
async fn metadata_text(request: RequestBuilder, msg: &str) -> Result<String> {
    let response = request
        .timeout(METADATA_TIMEOUT)
        .send()
        .await
        .map_err(|e| errors::from_http_error(e, msg))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| CredentialsError::new(!e.is_decode(), msg, e))?;
    if !status.is_success() {
        return Err(CredentialsError::from_msg(
            errors::is_retryable(status),
            format!("{msg} - {body}"),
        ));
    }
    Ok(body)
}
