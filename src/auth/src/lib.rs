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

//! Google Cloud Client Libraries for Rust - External Account Authentication
//!
//! **WARNING:** this crate is under active development. We expect multiple
//! breaking changes in the upcoming releases. Testing is also incomplete, we do
//! **not** recommend that you use this crate in production. We welcome feedback
//! about the APIs, documentation, missing features, bugs, etc.
//!
//! This crate creates [Credentials] for [Workload Identity Federation] and
//! [Workforce Identity Federation]. Applications running outside Google Cloud
//! (on AWS, on-premises, or on another cloud) obtain a token from their own
//! identity provider, the *subject token*, and exchange it for a Google Cloud
//! access token using the [Security Token Service]. Optionally the resulting
//! token is used to impersonate a service account.
//!
//! The subject token may come from a file, a URL, an executable, the AWS
//! metadata service, an X.509 certificate, or from application code. See
//! [credentials::external_account::Builder] for the configuration options.
//!
//! [Authentication methods at Google] is a good introduction on the topic of
//! authentication for Google Cloud services and other Google products.
//!
//! [Credentials]: crate::credentials::Credentials
//! [Workload Identity Federation]: https://cloud.google.com/iam/docs/workload-identity-federation
//! [Workforce Identity Federation]: https://cloud.google.com/iam/docs/workforce-identity-federation
//! [Security Token Service]: https://cloud.google.com/iam/docs/reference/sts/rest
//! [Authentication methods at Google]: https://cloud.google.com/docs/authentication

pub mod build_errors;
pub mod errors;

/// Types and functions to work with Google Cloud authentication [Credentials].
///
/// [Credentials]: https://cloud.google.com/docs/authentication#credentials
pub mod credentials;

pub mod token;

/// Location restrictions (trust boundaries) attached to access tokens.
pub mod trust_boundary;

pub(crate) mod constants;

/// Headers utility functions to work with Google Cloud authentication [Credentials].
///
/// [Credentials]: https://cloud.google.com/docs/authentication#credentials
pub(crate) mod headers_util;

/// A minimal client for the Google Compute Engine metadata service.
// The metadata service is only queried for trust boundaries.
#[allow(dead_code)]
pub(crate) mod mds;

pub(crate) mod retry;

/// The token cache
pub(crate) mod token_cache;

/// A `Result` alias where the `Err` case is
/// `google_cloud_auth_external_account::errors::CredentialsError`.
pub(crate) type Result<T> = std::result::Result<T, crate::errors::CredentialsError>;

/// A `Result` alias where the `Err` case is
/// `google_cloud_auth_external_account::build_errors::Error`.
pub(crate) type BuildResult<T> = std::result::Result<T, crate::build_errors::Error>;
