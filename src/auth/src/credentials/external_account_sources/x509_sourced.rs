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

//! X.509 workload certificates.
//!
//! The workload proves its identity with a client certificate during the
//! TLS handshake with the Security Token Service. The subject token itself
//! is empty.

use crate::build_errors::Error as BuilderError;
use crate::credentials::external_account::CertificateConfig;
use crate::credentials::subject_token::dynamic::SubjectTokenSource;
use crate::{BuildResult, Result};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CERTIFICATE_CONFIG_ENV: &str = "GOOGLE_API_CERTIFICATE_CONFIG";
const CERTIFICATE_CONFIG_FILE: &str = "certificate_config.json";

#[derive(Debug, Deserialize)]
struct CertificateConfigFile {
    cert_configs: CertConfigs,
}

#[derive(Debug, Deserialize)]
struct CertConfigs {
    workload: Option<WorkloadCertificate>,
}

#[derive(Debug, Deserialize)]
struct WorkloadCertificate {
    cert_path: String,
    key_path: String,
}

#[derive(Debug)]
pub(crate) struct X509SourcedCredentials {
    client: reqwest::Client,
}

impl X509SourcedCredentials {
    pub(crate) fn new(config: &CertificateConfig) -> BuildResult<Self> {
        let use_default = config.use_default_certificate_config.unwrap_or(false);
        let location = config
            .certificate_config_location
            .as_ref()
            .filter(|l| !l.is_empty());
        let path = match (use_default, location) {
            (true, None) => default_config_path()?,
            (false, Some(location)) => PathBuf::from(location),
            (true, Some(_)) => {
                return Err(BuilderError::invalid_config(
                    "`use_default_certificate_config` and `certificate_config_location` are mutually exclusive",
                ));
            }
            (false, None) => {
                return Err(BuilderError::invalid_config(
                    "either `use_default_certificate_config` or `certificate_config_location` must be set",
                ));
            }
        };
        let identity = load_identity(&path)?;
        let client = reqwest::Client::builder()
            .identity(identity)
            .build()
            .map_err(BuilderError::invalid_config)?;
        Ok(Self { client })
    }

    /// The mTLS client, used to exchange the (empty) subject token.
    pub(crate) fn client(&self) -> reqwest::Client {
        self.client.clone()
    }
}

#[async_trait::async_trait]
impl SubjectTokenSource for X509SourcedCredentials {
    async fn subject_token(&self) -> Result<String> {
        Ok(String::new())
    }

    fn provider_type(&self) -> &'static str {
        "x509"
    }
}

fn default_config_path() -> BuildResult<PathBuf> {
    if let Ok(path) = std::env::var(CERTIFICATE_CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let mut path = PathBuf::new();
    if cfg!(windows) {
        let appdata = std::env::var("APPDATA")
            .map_err(|_| BuilderError::loading("unable to find APPDATA"))?;
        path.push(appdata);
    } else {
        let home =
            std::env::var("HOME").map_err(|_| BuilderError::loading("unable to lookup HOME"))?;
        path.push(home);
        path.push(".config");
    }
    path.push("gcloud");
    path.push(CERTIFICATE_CONFIG_FILE);
    Ok(path)
}

fn load_identity(config_path: &Path) -> BuildResult<reqwest::Identity> {
    let contents = std::fs::read_to_string(config_path).map_err(BuilderError::loading)?;
    let config: CertificateConfigFile =
        serde_json::from_str(&contents).map_err(BuilderError::parsing)?;
    let workload = config.cert_configs.workload.ok_or_else(|| {
        BuilderError::invalid_config(format!(
            "no workload certificate in {}",
            config_path.display()
        ))
    })?;

    let cert = std::fs::read(&workload.cert_path).map_err(BuilderError::loading)?;
    let key = std::fs::read(&workload.key_path).map_err(BuilderError::loading)?;
    let certs = CertificateDer::pem_slice_iter(&cert)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(BuilderError::parsing)?;
    if certs.is_empty() {
        return Err(BuilderError::parsing(format!(
            "no certificates found in {}",
            workload.cert_path
        )));
    }
    PrivateKeyDer::from_pem_slice(&key).map_err(BuilderError::parsing)?;

    let mut pem = cert;
    pem.push(b'\n');
    pem.extend_from_slice(&key);
    reqwest::Identity::from_pem(&pem).map_err(BuilderError::parsing)
}
