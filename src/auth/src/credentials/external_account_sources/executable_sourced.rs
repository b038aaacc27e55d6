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

//! Subject tokens produced by a local executable.
//!
//! The protocol is documented in [AIP-4117]. The executable may also cache
//! its response in an output file, which is consulted before running the
//! command.
//!
//! [AIP-4117]: https://google.aip.dev/auth/4117#determining-the-subject-token-in-executable-sourced-credentials

use crate::build_errors::Error as BuilderError;
use crate::constants::{ID_TOKEN_TYPE, JWT_TOKEN_TYPE, SAML2_TOKEN_TYPE};
use crate::credentials::external_account::ExecutableConfig;
use crate::credentials::impersonated;
use crate::credentials::subject_token::dynamic::SubjectTokenSource;
use crate::errors::{self, CredentialsError};
use crate::{BuildResult, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::process::Command;

const SUPPORTED_MAX_VERSION: i64 = 1;
// Defined by AIP-4117.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TIMEOUT: Duration = Duration::from_secs(120);

const EXECUTABLE_SOURCE: &str = "response";
const OUTPUT_FILE_SOURCE: &str = "output file";

const ALLOW_EXECUTABLES_ENV: &str = "GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES";

/// The process environment seen by the executable.
///
/// Tests replace it to avoid spawning real processes.
#[async_trait::async_trait]
pub(crate) trait ExecutableEnvironment: std::fmt::Debug + Send + Sync {
    /// The environment inherited by the child process.
    fn existing_env(&self) -> Vec<(String, String)>;

    fn getenv(&self, key: &str) -> Option<String>;

    /// Runs `command` and returns its trimmed output.
    async fn run(
        &self,
        command: &str,
        env: Vec<(String, String)>,
        timeout: Duration,
    ) -> Result<String>;

    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug)]
struct RuntimeEnvironment;

#[async_trait::async_trait]
impl ExecutableEnvironment for RuntimeEnvironment {
    fn existing_env(&self) -> Vec<(String, String)> {
        std::env::vars().collect()
    }

    fn getenv(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    async fn run(
        &self,
        command: &str,
        env: Vec<(String, String)>,
        timeout: Duration,
    ) -> Result<String> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| errors::non_retryable_from_str("executable command is empty"))?;
        let output = Command::new(program)
            .args(parts)
            .env_clear()
            .envs(env)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| {
                CredentialsError::from_msg(
                    true,
                    format!("executable command timed out after {timeout:?}"),
                )
            })?
            .map_err(|e| CredentialsError::new(false, "executable command failed", e))?;

        if !output.status.success() {
            let msg = match output.status.code() {
                Some(code) => format!("executable command failed with exit code {code}"),
                None => "executable command was terminated by a signal".to_string(),
            };
            return Err(errors::non_retryable_from_str(msg));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if !stdout.is_empty() {
            return Ok(stdout.to_string());
        }
        Ok(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// The response format of the executable and its output file.
#[derive(Debug, Default, Deserialize)]
struct ExecutableResponse {
    version: Option<i64>,
    success: Option<bool>,
    token_type: Option<String>,
    expiration_time: Option<i64>,
    id_token: Option<String>,
    saml_response: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

/// Failures while parsing a response.
///
/// Non-cacheable failures in the output file force a new execution, while
/// other failures are reported to the caller.
#[derive(Debug, PartialEq)]
enum ResponseError {
    NonCacheable(String),
    Invalid(String),
}

impl From<ResponseError> for CredentialsError {
    fn from(value: ResponseError) -> Self {
        match value {
            ResponseError::NonCacheable(msg) | ResponseError::Invalid(msg) => {
                errors::non_retryable_from_str(msg)
            }
        }
    }
}

fn missing_field(source: &str, field: &str) -> ResponseError {
    ResponseError::Invalid(format!("{source:?} missing {field:?} field"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug)]
pub(crate) struct ExecutableSourcedCredentials {
    command: String,
    timeout: Duration,
    output_file: Option<String>,
    audience: String,
    subject_token_type: String,
    impersonation_url: Option<String>,
    env: Arc<dyn ExecutableEnvironment>,
}

impl ExecutableSourcedCredentials {
    pub(crate) fn new(
        config: ExecutableConfig,
        audience: String,
        subject_token_type: String,
        impersonation_url: Option<String>,
    ) -> BuildResult<Self> {
        if config.command.is_empty() {
            return Err(BuilderError::missing_field("command"));
        }
        let timeout = match config.timeout_millis {
            None => DEFAULT_TIMEOUT,
            Some(millis) => Duration::from_millis(millis.into()),
        };
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&timeout) {
            return Err(BuilderError::invalid_config(
                "invalid `timeout_millis` field, executable timeout must be between 5 and 120 seconds",
            ));
        }
        Ok(Self {
            command: config.command,
            timeout,
            output_file: config.output_file.filter(|f| !f.is_empty()),
            audience,
            subject_token_type,
            impersonation_url,
            env: Arc::new(RuntimeEnvironment),
        })
    }

    #[cfg(test)]
    fn with_environment<E: ExecutableEnvironment + 'static>(mut self, env: E) -> Self {
        self.env = Arc::new(env);
        self
    }

    fn parse_response(
        &self,
        response: &str,
        source: &str,
        now: i64,
    ) -> std::result::Result<String, ResponseError> {
        let response: ExecutableResponse = serde_json::from_str(response).map_err(|_| {
            ResponseError::Invalid(format!("unable to parse {source:?}: {response}"))
        })?;

        let version = response
            .version
            .filter(|v| *v != 0)
            .ok_or_else(|| missing_field(source, "version"))?;
        let success = response
            .success
            .ok_or_else(|| missing_field(source, "success"))?;
        if !success {
            return match (non_empty(response.code), non_empty(response.message)) {
                (Some(code), Some(message)) => Err(ResponseError::NonCacheable(format!(
                    "response contains unsuccessful response: ({code}) {message}"
                ))),
                _ => Err(ResponseError::NonCacheable(
                    "response must include `code` and `message` fields when unsuccessful"
                        .to_string(),
                )),
            };
        }
        if !(1..=SUPPORTED_MAX_VERSION).contains(&version) {
            return Err(ResponseError::Invalid(format!(
                "{source} contains unsupported version: {version}"
            )));
        }
        let expiration_time = response.expiration_time.filter(|t| *t != 0);
        if expiration_time.is_none() && self.output_file.is_some() {
            return Err(missing_field(source, "expiration_time"));
        }
        let token_type =
            non_empty(response.token_type).ok_or_else(|| missing_field(source, "token_type"))?;
        if expiration_time.is_some_and(|t| t < now) {
            return Err(ResponseError::NonCacheable(
                "the token returned by the executable is expired".to_string(),
            ));
        }

        match token_type.as_str() {
            JWT_TOKEN_TYPE | ID_TOKEN_TYPE => {
                non_empty(response.id_token).ok_or_else(|| missing_field(source, "id_token"))
            }
            SAML2_TOKEN_TYPE => non_empty(response.saml_response)
                .ok_or_else(|| missing_field(source, "saml_response")),
            _ => Err(ResponseError::Invalid(format!(
                "{source} contains unsupported token type"
            ))),
        }
    }

    /// Returns the cached token, if the output file holds a usable one.
    async fn from_output_file(&self) -> Result<Option<String>> {
        let Some(output_file) = &self.output_file else {
            return Ok(None);
        };
        let content = match tokio::fs::read_to_string(output_file).await {
            Ok(c) if !c.trim().is_empty() => c,
            Ok(_) => return Ok(None),
            Err(e) => {
                tracing::debug!("cannot read executable output file {output_file}: {e}");
                return Ok(None);
            }
        };
        let now = self.env.now().unix_timestamp();
        match self.parse_response(&content, OUTPUT_FILE_SOURCE, now) {
            Ok(token) => Ok(Some(token)),
            Err(ResponseError::NonCacheable(msg)) => {
                tracing::debug!("ignoring cached executable response: {msg}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn impersonated_email(&self) -> Option<String> {
        self.impersonation_url
            .as_deref()
            .and_then(impersonated::service_account_email)
    }

    fn executable_env(&self) -> Vec<(String, String)> {
        let mut env = self.env.existing_env();
        env.push((
            "GOOGLE_EXTERNAL_ACCOUNT_AUDIENCE".to_string(),
            self.audience.clone(),
        ));
        env.push((
            "GOOGLE_EXTERNAL_ACCOUNT_TOKEN_TYPE".to_string(),
            self.subject_token_type.clone(),
        ));
        env.push((
            "GOOGLE_EXTERNAL_ACCOUNT_INTERACTIVE".to_string(),
            "0".to_string(),
        ));
        if let Some(email) = self.impersonated_email() {
            env.push(("GOOGLE_EXTERNAL_ACCOUNT_IMPERSONATED_EMAIL".to_string(), email));
        }
        if let Some(output_file) = &self.output_file {
            env.push((
                "GOOGLE_EXTERNAL_ACCOUNT_OUTPUT_FILE".to_string(),
                output_file.clone(),
            ));
        }
        env
    }

    async fn from_command(&self) -> Result<String> {
        // Running arbitrary commands from a configuration file requires an
        // explicit opt-in.
        if self.env.getenv(ALLOW_EXECUTABLES_ENV).as_deref() != Some("1") {
            return Err(errors::non_retryable_from_str(
                "executables need to be explicitly allowed (set GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES to '1') to run",
            ));
        }
        tracing::debug!("running executable to obtain subject token");
        let output = self
            .env
            .run(&self.command, self.executable_env(), self.timeout)
            .await?;
        let now = self.env.now().unix_timestamp();
        Ok(self.parse_response(&output, EXECUTABLE_SOURCE, now)?)
    }
}

#[async_trait::async_trait]
impl SubjectTokenSource for ExecutableSourcedCredentials {
    async fn subject_token(&self) -> Result<String> {
        if let Some(token) = self.from_output_file().await? {
            return Ok(token);
        }
        self.from_command().await
    }

    fn provider_type(&self) -> &'static str {
        "executable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    type TestResult = anyhow::Result<()>;

    const AUDIENCE: &str = "//iam.googleapis.com/projects/123/locations/global/workloadIdentityPools/pool/providers/oidc";
    const IMPERSONATION_URL: &str = "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/sa@project.iam.gserviceaccount.com:generateAccessToken";
    // 2024-01-01T00:00:00Z
    const NOW: i64 = 1_704_067_200;

    #[derive(Debug)]
    struct FakeEnvironment {
        vars: HashMap<String, String>,
        output: Result<String>,
        runs: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl FakeEnvironment {
        fn new(output: Result<String>) -> Self {
            Self {
                vars: HashMap::from([(ALLOW_EXECUTABLES_ENV.to_string(), "1".to_string())]),
                output,
                runs: Mutex::new(Vec::new()),
            }
        }

        fn run_count(&self) -> usize {
            self.runs.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ExecutableEnvironment for Arc<FakeEnvironment> {
        fn existing_env(&self) -> Vec<(String, String)> {
            vec![("PATH".to_string(), "/usr/bin".to_string())]
        }

        fn getenv(&self, key: &str) -> Option<String> {
            self.vars.get(key).cloned()
        }

        async fn run(
            &self,
            command: &str,
            env: Vec<(String, String)>,
            _timeout: Duration,
        ) -> Result<String> {
            assert_eq!(command, "./fetch-token --flag");
            self.runs.lock().unwrap().push(env);
            self.output.clone()
        }

        fn now(&self) -> OffsetDateTime {
            OffsetDateTime::from_unix_timestamp(NOW).unwrap()
        }
    }

    fn config(output_file: Option<String>) -> ExecutableConfig {
        ExecutableConfig {
            command: "./fetch-token --flag".to_string(),
            timeout_millis: None,
            output_file,
        }
    }

    fn source(output_file: Option<String>, env: &Arc<FakeEnvironment>) -> ExecutableSourcedCredentials {
        ExecutableSourcedCredentials::new(
            config(output_file),
            AUDIENCE.to_string(),
            JWT_TOKEN_TYPE.to_string(),
            Some(IMPERSONATION_URL.to_string()),
        )
        .unwrap()
        .with_environment(env.clone())
    }

    fn success_response(expiration_time: i64) -> String {
        json!({
            "version": 1,
            "success": true,
            "token_type": JWT_TOKEN_TYPE,
            "id_token": "test-id-token",
            "expiration_time": expiration_time,
        })
        .to_string()
    }

    #[test_case(None, Some(DEFAULT_TIMEOUT))]
    #[test_case(Some(4999), None)]
    #[test_case(Some(5000), Some(Duration::from_millis(5000)))]
    #[test_case(Some(120000), Some(Duration::from_millis(120000)))]
    #[test_case(Some(120001), None)]
    fn timeout_bounds(timeout_millis: Option<u32>, want: Option<Duration>) {
        let config = ExecutableConfig {
            timeout_millis,
            ..config(None)
        };
        let got = ExecutableSourcedCredentials::new(
            config,
            AUDIENCE.to_string(),
            JWT_TOKEN_TYPE.to_string(),
            None,
        );
        match want {
            Some(want) => assert_eq!(got.unwrap().timeout, want),
            None => {
                let err = got.unwrap_err();
                assert!(err.is_invalid_config(), "{err:?}");
                assert!(err.to_string().contains("between 5 and 120 seconds"), "{err}");
            }
        }
    }

    #[test]
    fn missing_command() {
        let config = ExecutableConfig {
            command: String::new(),
            ..config(None)
        };
        let err = ExecutableSourcedCredentials::new(
            config,
            AUDIENCE.to_string(),
            JWT_TOKEN_TYPE.to_string(),
            None,
        )
        .unwrap_err();
        assert!(err.is_missing_field(), "{err:?}");
    }

    #[tokio::test]
    async fn run_executable() -> TestResult {
        let env = Arc::new(FakeEnvironment::new(Ok(success_response(NOW + 3600))));
        let source = source(None, &env);
        let token = source.subject_token().await?;
        assert_eq!(token, "test-id-token");
        assert_eq!(source.provider_type(), "executable");
        assert_eq!(env.run_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn executable_environment() -> TestResult {
        let env = Arc::new(FakeEnvironment::new(Ok(success_response(NOW + 3600))));
        let source = source(Some("/does/not/exist/output.json".to_string()), &env);
        source.subject_token().await?;

        let runs = env.runs.lock().unwrap();
        let got: HashMap<_, _> = runs[0].iter().cloned().collect();
        let want = HashMap::from([
            ("PATH", "/usr/bin"),
            ("GOOGLE_EXTERNAL_ACCOUNT_AUDIENCE", AUDIENCE),
            ("GOOGLE_EXTERNAL_ACCOUNT_TOKEN_TYPE", JWT_TOKEN_TYPE),
            ("GOOGLE_EXTERNAL_ACCOUNT_INTERACTIVE", "0"),
            (
                "GOOGLE_EXTERNAL_ACCOUNT_IMPERSONATED_EMAIL",
                "sa@project.iam.gserviceaccount.com",
            ),
            (
                "GOOGLE_EXTERNAL_ACCOUNT_OUTPUT_FILE",
                "/does/not/exist/output.json",
            ),
        ])
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
        assert_eq!(got, want);
        Ok(())
    }

    #[tokio::test]
    async fn executables_not_allowed() {
        let mut fake = FakeEnvironment::new(Ok(success_response(NOW + 3600)));
        fake.vars.clear();
        let env = Arc::new(fake);
        let err = source(None, &env).subject_token().await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.to_string().contains(ALLOW_EXECUTABLES_ENV), "{err}");
        assert_eq!(env.run_count(), 0);
    }

    #[tokio::test]
    async fn run_error() {
        let env = Arc::new(FakeEnvironment::new(Err(CredentialsError::from_msg(
            true,
            "executable command timed out after 30s",
        ))));
        let err = source(None, &env).subject_token().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn output_file_cache_hit() -> TestResult {
        let mut file = NamedTempFile::new()?;
        write!(file, "{}", success_response(NOW + 3600))?;
        let env = Arc::new(FakeEnvironment::new(Err(CredentialsError::from_msg(
            false,
            "should not run",
        ))));
        let source = source(Some(file.path().to_string_lossy().to_string()), &env);
        let token = source.subject_token().await?;
        assert_eq!(token, "test-id-token");
        assert_eq!(env.run_count(), 0);
        Ok(())
    }

    #[test_case(success_response(NOW - 1); "expired")]
    #[test_case(json!({"version": 1, "success": false, "code": "401", "message": "denied"}).to_string(); "user failure")]
    #[test_case(json!({"version": 1, "success": false}).to_string(); "malformed failure")]
    #[test_case(String::new(); "empty")]
    #[tokio::test]
    async fn output_file_cache_miss(contents: String) -> TestResult {
        let mut file = NamedTempFile::new()?;
        write!(file, "{contents}")?;
        let env = Arc::new(FakeEnvironment::new(Ok(success_response(NOW + 3600))));
        let source = source(Some(file.path().to_string_lossy().to_string()), &env);
        let token = source.subject_token().await?;
        assert_eq!(token, "test-id-token");
        assert_eq!(env.run_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn output_file_invalid() -> TestResult {
        let mut file = NamedTempFile::new()?;
        write!(file, "not json")?;
        let env = Arc::new(FakeEnvironment::new(Ok(success_response(NOW + 3600))));
        let source = source(Some(file.path().to_string_lossy().to_string()), &env);
        let err = source.subject_token().await.unwrap_err();
        assert!(
            err.to_string().contains("unable to parse \"output file\""),
            "{err}"
        );
        assert_eq!(env.run_count(), 0);
        Ok(())
    }

    #[test_case(json!({"success": true}), "\"response\" missing \"version\" field")]
    #[test_case(json!({"version": 1}), "\"response\" missing \"success\" field")]
    #[test_case(json!({"version": 1, "success": false}), "must include `code` and `message`")]
    #[test_case(json!({"version": 1, "success": false, "code": "401", "message": "denied"}), "unsuccessful response: (401) denied")]
    #[test_case(json!({"version": 2, "success": true}), "response contains unsupported version: 2")]
    #[test_case(json!({"version": 1, "success": true, "id_token": "t"}), "\"response\" missing \"token_type\" field")]
    #[test_case(json!({"version": 1, "success": true, "token_type": JWT_TOKEN_TYPE, "id_token": "t", "expiration_time": NOW - 1}), "is expired")]
    #[test_case(json!({"version": 1, "success": true, "token_type": JWT_TOKEN_TYPE}), "\"response\" missing \"id_token\" field")]
    #[test_case(json!({"version": 1, "success": true, "token_type": SAML2_TOKEN_TYPE}), "\"response\" missing \"saml_response\" field")]
    #[test_case(json!({"version": 1, "success": true, "token_type": "unknown", "id_token": "t"}), "response contains unsupported token type")]
    fn parse_errors(response: serde_json::Value, want: &str) {
        let env = Arc::new(FakeEnvironment::new(Ok(String::new())));
        let source = source(None, &env);
        let err = source
            .parse_response(&response.to_string(), EXECUTABLE_SOURCE, NOW)
            .unwrap_err();
        let msg = match err {
            ResponseError::NonCacheable(m) | ResponseError::Invalid(m) => m,
        };
        assert!(msg.contains(want), "{msg}");
    }

    #[test]
    fn parse_output_file_requires_expiration() {
        let env = Arc::new(FakeEnvironment::new(Ok(String::new())));
        let source = source(Some("output.json".to_string()), &env);
        let response = json!({"version": 1, "success": true, "token_type": JWT_TOKEN_TYPE, "id_token": "t"});
        let err = source
            .parse_response(&response.to_string(), OUTPUT_FILE_SOURCE, NOW)
            .unwrap_err();
        assert_eq!(
            err,
            ResponseError::Invalid("\"output file\" missing \"expiration_time\" field".to_string())
        );
    }

    #[test_case(JWT_TOKEN_TYPE, "id_token")]
    #[test_case(ID_TOKEN_TYPE, "id_token")]
    #[test_case(SAML2_TOKEN_TYPE, "saml_response")]
    fn parse_token_types(token_type: &str, field: &str) {
        let env = Arc::new(FakeEnvironment::new(Ok(String::new())));
        let source = source(None, &env);
        let mut response = json!({"version": 1, "success": true, "token_type": token_type});
        response[field] = json!("test-token");
        let token = source
            .parse_response(&response.to_string(), EXECUTABLE_SOURCE, NOW)
            .unwrap();
        assert_eq!(token, "test-token");
    }

    #[test_case(None, None)]
    #[test_case(Some(IMPERSONATION_URL), Some("sa@project.iam.gserviceaccount.com"))]
    #[test_case(Some("https://example.com/impersonate"), None)]
    fn impersonated_email(url: Option<&str>, want: Option<&str>) {
        let source = ExecutableSourcedCredentials::new(
            config(None),
            AUDIENCE.to_string(),
            JWT_TOKEN_TYPE.to_string(),
            url.map(str::to_string),
        )
        .unwrap();
        assert_eq!(source.impersonated_email().as_deref(), want);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runtime_environment_runs_command() -> TestResult {
        let env = RuntimeEnvironment;
        let got = env
            .run(
                "echo hello",
                env.existing_env(),
                Duration::from_secs(5),
            )
            .await?;
        assert_eq!(got, "hello");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runtime_environment_exit_code() {
        let env = RuntimeEnvironment;
        let err = env
            .run("false", env.existing_env(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code 1"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runtime_environment_timeout() {
        let env = RuntimeEnvironment;
        let err = env
            .run("sleep 5", env.existing_env(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
