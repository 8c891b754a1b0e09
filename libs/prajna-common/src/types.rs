use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Languages accepted by the judge.
///
/// `Cpp` goes through a separate build phase, `Python` runs directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "c++")]
    Cpp,
    #[serde(alias = "py")]
    Python,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageKind {
    Compiled,
    Interpreted,
}

impl Language {
    pub fn kind(&self) -> LanguageKind {
        match self {
            Language::Cpp => LanguageKind::Compiled,
            Language::Python => LanguageKind::Interpreted,
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.kind() == LanguageKind::Compiled
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Python => "python",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpp" | "c++" => Ok(Language::Cpp),
            "python" | "py" => Ok(Language::Python),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// One request to execute code once. Built per invocation and dropped after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    #[serde(default)]
    pub stdin: String,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language, stdin: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language,
            stdin: stdin.into(),
        }
    }
}

/// Terminal status of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    CompilationError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    InternalError,
    SystemError,
}

impl StatusCode {
    pub fn label(&self) -> &'static str {
        match self {
            StatusCode::Success => "Success",
            StatusCode::CompilationError => "Compilation Error",
            StatusCode::RuntimeError => "Runtime Error",
            StatusCode::TimeLimitExceeded => "Time Limit Exceeded",
            StatusCode::MemoryLimitExceeded => "Memory Limit Exceeded",
            StatusCode::InternalError => "Internal Error",
            StatusCode::SystemError => "System Error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of one [`ExecutionRequest`]. Produced exactly once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: StatusCode,
    pub stdout: String,
    /// Compiler output, stderr of a crashed run, or the fault description.
    pub diagnostic: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub exit_code: Option<i64>,
}

impl ExecutionOutcome {
    pub fn success(stdout: String, elapsed_ms: u64) -> Self {
        Self {
            status: StatusCode::Success,
            stdout,
            diagnostic: None,
            elapsed_ms: Some(elapsed_ms),
            exit_code: Some(0),
        }
    }

    pub fn failure(status: StatusCode, diagnostic: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            diagnostic: Some(diagnostic.into()),
            elapsed_ms: None,
            exit_code: None,
        }
    }

    pub fn time_limit_exceeded() -> Self {
        Self::failure(
            StatusCode::TimeLimitExceeded,
            "Execution exceeded time limit.",
        )
    }

    pub fn memory_limit_exceeded(limit_mb: u64) -> Self {
        Self::failure(
            StatusCode::MemoryLimitExceeded,
            format!("Execution exceeded memory limit of {}MB.", limit_mb),
        )
    }

    pub fn internal_error(diagnostic: impl Into<String>) -> Self {
        Self::failure(StatusCode::InternalError, diagnostic)
    }

    pub fn system_error(diagnostic: impl Into<String>) -> Self {
        Self::failure(
            StatusCode::SystemError,
            format!("An unexpected error occurred: {}", diagnostic.into()),
        )
    }

    pub fn with_exit_code(mut self, exit_code: Option<i64>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_elapsed(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }
}

/// One (input, expected output) pair of a problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// 1-based judging position.
    pub ordinal: u32,
    /// Identifier taken from the `input_<id>` file name.
    pub id: String,
    pub input: String,
    pub expected_output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictCode {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "CE")]
    CompilationError,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "IE")]
    InternalError,
}

impl VerdictCode {
    pub fn code(&self) -> &'static str {
        match self {
            VerdictCode::Accepted => "AC",
            VerdictCode::WrongAnswer => "WA",
            VerdictCode::TimeLimitExceeded => "TLE",
            VerdictCode::MemoryLimitExceeded => "MLE",
            VerdictCode::CompilationError => "CE",
            VerdictCode::RuntimeError => "RE",
            VerdictCode::InternalError => "IE",
        }
    }
}

impl fmt::Display for VerdictCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Final judging outcome across all test cases of a problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub verdict: VerdictCode,
    pub passed_cases: u32,
    pub total_cases: u32,
    pub failing_case: Option<u32>,
    pub diagnostic: Option<String>,
    pub cumulative_time_ms: u64,
}

impl JudgeVerdict {
    /// Verdict for a fault that happened before any case could run.
    pub fn internal_error(diagnostic: impl Into<String>) -> Self {
        Self {
            verdict: VerdictCode::InternalError,
            passed_cases: 0,
            total_cases: 0,
            failing_case: None,
            diagnostic: Some(diagnostic.into()),
            cumulative_time_ms: 0,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict == VerdictCode::Accepted
    }
}

/// A judge job as it travels through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub code: String,
    pub language: Language,
    pub problem_id: String,
}

impl Job {
    pub fn new(code: impl Into<String>, language: Language, problem_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            language,
            problem_id: problem_id.into(),
        }
    }
}

/// Externally observable job state. Transitions only move forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "verdict", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Terminal(JudgeVerdict),
}

impl JobState {
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Terminal(_) => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Terminal(_) => "terminal",
        }
    }

    /// Whether moving from `self` to `next` keeps the state machine monotonic.
    pub fn can_advance_to(&self, next: &JobState) -> bool {
        next.rank() > self.rank()
    }
}

/// Job state as persisted by a submission store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub state: JobState,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: Uuid, state: JobState) -> Self {
        Self {
            job_id,
            state,
            updated_at: Utc::now(),
        }
    }
}

/// Ad-hoc run request, not tied to a persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub id: Uuid,
    pub request: ExecutionRequest,
}
