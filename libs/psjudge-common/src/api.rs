//! Request and response records of the builder HTTP surface.
//!
//! Every request field is optional at the serde level so that a missing
//! field is reported through [`JudgeError::InvalidSubmission`] with the
//! field name, rather than as an opaque deserialization failure.

use serde::{Deserialize, Serialize};

use crate::error::{JudgeError, Result};
use crate::types::{BuildJob, BuildStatus, TestCase};

/// Safety limits that keep pathological payloads out of the pipeline
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_DATA_BYTES: usize = 10 * 1024 * 1024; // 10MB
pub const MAX_UUID_LEN: usize = 128;

/// Identifiers end up inside storage keys, so only a conservative
/// alphabet is accepted.
pub fn validate_uuid(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(JudgeError::InvalidSubmission(format!("missing field '{}'", field)));
    }
    if value.len() > MAX_UUID_LEN {
        return Err(JudgeError::InvalidSubmission(format!(
            "field '{}' exceeds {} characters",
            field, MAX_UUID_LEN
        )));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(JudgeError::InvalidSubmission(format!(
            "field '{}' contains unsupported characters",
            field
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterBuildRequest {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub assignment_uuid: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub source: String,
}

impl RegisterBuildRequest {
    pub fn validate(&self) -> Result<()> {
        validate_uuid("uuid", &self.uuid)?;
        validate_uuid("assignment_uuid", &self.assignment_uuid)?;
        if self.language.trim().is_empty() {
            return Err(JudgeError::InvalidSubmission("missing field 'language'".into()));
        }
        if self.source.is_empty() {
            return Err(JudgeError::InvalidSubmission("missing field 'source'".into()));
        }
        if self.source.len() > MAX_SOURCE_BYTES {
            return Err(JudgeError::InvalidSubmission(format!(
                "source exceeds maximum size of {} bytes",
                MAX_SOURCE_BYTES
            )));
        }
        Ok(())
    }

    pub fn into_job(self) -> Result<BuildJob> {
        self.validate()?;
        Ok(BuildJob::new(
            &self.uuid,
            &self.assignment_uuid,
            self.language.trim(),
            &self.source,
        ))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterTestCaseRequest {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub assignment_uuid: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub expected: String,
}

impl RegisterTestCaseRequest {
    pub fn validate(&self) -> Result<()> {
        validate_uuid("uuid", &self.uuid)?;
        validate_uuid("assignment_uuid", &self.assignment_uuid)?;
        if self.input.len() + self.expected.len() > MAX_TEST_DATA_BYTES {
            return Err(JudgeError::InvalidSubmission(format!(
                "test case exceeds maximum size of {} bytes",
                MAX_TEST_DATA_BYTES
            )));
        }
        Ok(())
    }

    pub fn into_test_case(self) -> Result<TestCase> {
        self.validate()?;
        Ok(TestCase {
            uuid: self.uuid,
            assignment_uuid: self.assignment_uuid,
            input: self.input,
            expected: self.expected,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatusResponse {
    pub uuid: String,
    pub status: BuildStatus,
    pub score: u32,
    pub details: String,
}

impl From<&BuildJob> for BuildStatusResponse {
    fn from(job: &BuildJob) -> Self {
        Self {
            uuid: job.uuid.clone(),
            status: job.status,
            score: job.score,
            details: job.details.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReportResponse {
    pub uuid: String,
    pub status: BuildStatus,
    pub exception: String,
    pub build_log: String,
    pub tests_log: String,
    pub tests_passed: u32,
    pub tests_total: u32,
}

impl From<&BuildJob> for BuildReportResponse {
    fn from(job: &BuildJob) -> Self {
        Self {
            uuid: job.uuid.clone(),
            status: job.status,
            exception: job.exception.clone(),
            build_log: job.build_log.clone(),
            tests_log: job.tests_log.clone(),
            tests_passed: job.tests_passed,
            tests_total: job.tests_total,
        }
    }
}

/// `{"error": {"text": "..."}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorText,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorText {
    pub text: String,
}

impl ErrorResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            error: ErrorText { text: text.into() },
        }
    }

    /// Extracts the error text from an arbitrary response body, if the body
    /// has the error shape.
    pub fn from_body(body: &serde_json::Value) -> Option<String> {
        body.get("error")?
            .get("text")?
            .as_str()
            .map(|text| text.to_string())
    }
}

/// Broadcast after a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFinishedEvent {
    pub key: String,
    pub succeed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_request() -> RegisterBuildRequest {
        RegisterBuildRequest {
            uuid: "7f1c2a9e-0d4b-4c55-9a57-3f0b9f5d8b11".into(),
            assignment_uuid: "assignment-1".into(),
            language: "pascal".into(),
            source: "BEGIN END.".into(),
        }
    }

    #[test]
    fn test_valid_build_request_becomes_pending_job() {
        let job = build_request().into_job().unwrap();
        assert_eq!(job.status, BuildStatus::Pending);
        assert_eq!(job.language, "pascal");
    }

    #[test]
    fn test_missing_fields_are_named() {
        let request: RegisterBuildRequest =
            serde_json::from_str(r#"{"assignment_uuid": "a1", "language": "c++", "source": "x"}"#)
                .unwrap();
        let err = request.validate().unwrap_err();
        assert!(err.to_string().contains("'uuid'"));

        let mut request = build_request();
        request.source.clear();
        assert!(request.validate().unwrap_err().to_string().contains("'source'"));
    }

    #[test]
    fn test_uuid_alphabet_is_restricted() {
        assert!(validate_uuid("uuid", "abc-DEF_123").is_ok());
        assert!(validate_uuid("uuid", "a:b").is_err());
        assert!(validate_uuid("uuid", "a b").is_err());
        assert!(validate_uuid("uuid", &"x".repeat(MAX_UUID_LEN + 1)).is_err());
    }

    #[test]
    fn test_oversized_source_rejected() {
        let mut request = build_request();
        request.source = "a".repeat(MAX_SOURCE_BYTES + 1);
        assert!(matches!(
            request.validate(),
            Err(JudgeError::InvalidSubmission(_))
        ));
    }

    #[test]
    fn test_test_case_allows_empty_io() {
        let case = RegisterTestCaseRequest {
            uuid: "t1".into(),
            assignment_uuid: "a1".into(),
            input: String::new(),
            expected: String::new(),
        }
        .into_test_case()
        .unwrap();
        assert_eq!(case.input, "");
    }

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(ErrorResponse::new("build 'x' not found")).unwrap();
        assert_eq!(body["error"]["text"], "build 'x' not found");
        assert_eq!(
            ErrorResponse::from_body(&body).as_deref(),
            Some("build 'x' not found")
        );
        assert_eq!(ErrorResponse::from_body(&serde_json::json!({"uuid": "x"})), None);
    }
}
