/// Judge Engine - fail-fast sweep over a problem's test cases
///
/// **Core Responsibility:**
/// Run a submission once per test case, in order, and derive one verdict.
///
/// **Algorithm:**
/// 1. Load the ordered case set; no cases (or no directory) is IE, nothing runs
/// 2. Execute each case; a non-Success status ends judging with the mapped verdict
/// 3. Compare output; a mismatch ends judging with WA
/// 4. All cases matched: AC with the summed run time
///
/// **Normalization Rules:**
/// - `\r\n` is read as `\n`
/// - Leading and trailing whitespace of the whole output is ignored
/// - Everything else, case included, must match exactly
///
/// Cases never run concurrently: fail-fast and cumulative timing both
/// depend on the order.

use crate::executor::Executor;
use crate::problem::ProblemStore;
use prajna_common::types::{
    ExecutionOutcome, ExecutionRequest, JudgeVerdict, Language, StatusCode, TestCase, VerdictCode,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct Judge {
    executor: Arc<Executor>,
    problems: ProblemStore,
}

/// Running totals while cases pass.
struct Tally {
    passed: u32,
    total: u32,
    time_ms: u64,
}

impl Tally {
    fn fail(&self, verdict: VerdictCode, case: &TestCase, diagnostic: String) -> JudgeVerdict {
        JudgeVerdict {
            verdict,
            passed_cases: self.passed,
            total_cases: self.total,
            failing_case: Some(case.ordinal),
            diagnostic: Some(diagnostic),
            cumulative_time_ms: self.time_ms,
        }
    }

    fn accept(&self) -> JudgeVerdict {
        JudgeVerdict {
            verdict: VerdictCode::Accepted,
            passed_cases: self.passed,
            total_cases: self.total,
            failing_case: None,
            diagnostic: None,
            cumulative_time_ms: self.time_ms,
        }
    }
}

impl Judge {
    pub fn new(executor: Arc<Executor>, problems: ProblemStore) -> Self {
        Self { executor, problems }
    }

    /// The executor behind this judge, for ad-hoc runs.
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    #[instrument(skip(self, code))]
    pub async fn judge(&self, code: &str, language: Language, problem_id: &str) -> JudgeVerdict {
        let cases = match self.problems.load_cases(problem_id).await {
            Ok(cases) => cases,
            Err(e) => {
                warn!(error = %e, "Cannot judge: problem data unavailable");
                return JudgeVerdict::internal_error(e.to_string());
            }
        };

        self.judge_cases(code, language, &cases).await
    }

    /// Judge against an already-loaded case set.
    pub async fn judge_cases(
        &self,
        code: &str,
        language: Language,
        cases: &[TestCase],
    ) -> JudgeVerdict {
        if cases.is_empty() {
            return JudgeVerdict::internal_error("No test cases found.");
        }

        let mut tally = Tally {
            passed: 0,
            total: cases.len() as u32,
            time_ms: 0,
        };

        for case in cases {
            let request = ExecutionRequest::new(code, language, case.input.clone());
            let outcome = self.executor.execute(&request).await;

            if !outcome.is_success() {
                let verdict = verdict_for_status(outcome.status);
                info!(
                    case = case.ordinal,
                    status = ?outcome.status,
                    verdict = %verdict,
                    passed = tally.passed,
                    "Case failed, stopping"
                );
                return tally.fail(verdict, case, failure_diagnostic(&outcome));
            }

            if !outputs_match(&outcome.stdout, &case.expected_output) {
                info!(case = case.ordinal, passed = tally.passed, "Wrong answer, stopping");
                let diagnostic = format!(
                    "Wrong Answer on case {}.\nExpected: {}\nGot: {}",
                    case.id,
                    normalize(&case.expected_output),
                    normalize(&outcome.stdout)
                );
                return tally.fail(VerdictCode::WrongAnswer, case, diagnostic);
            }

            tally.passed += 1;
            tally.time_ms += outcome.elapsed_ms.unwrap_or(0);
        }

        info!(
            total_cases = tally.total,
            cumulative_time_ms = tally.time_ms,
            "All cases passed"
        );
        tally.accept()
    }
}

pub fn verdict_for_status(status: StatusCode) -> VerdictCode {
    match status {
        StatusCode::TimeLimitExceeded => VerdictCode::TimeLimitExceeded,
        StatusCode::MemoryLimitExceeded => VerdictCode::MemoryLimitExceeded,
        StatusCode::CompilationError => VerdictCode::CompilationError,
        StatusCode::RuntimeError => VerdictCode::RuntimeError,
        StatusCode::Success | StatusCode::InternalError | StatusCode::SystemError => {
            VerdictCode::InternalError
        }
    }
}

fn failure_diagnostic(outcome: &ExecutionOutcome) -> String {
    match &outcome.diagnostic {
        Some(diagnostic) => diagnostic.clone(),
        None if !outcome.stdout.is_empty() => outcome.stdout.clone(),
        None => outcome.status.label().to_string(),
    }
}

fn normalize(output: &str) -> String {
    output.replace("\r\n", "\n").trim().to_string()
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize(actual) == normalize(expected)
}


#[cfg(all(test, target_os = "linux"))]
mod process_tests {
    use super::*;
    use crate::executor::process_tests::process_executor;
    use std::fs;

    #[tokio::test]
    async fn test_end_to_end_on_process_backend() {
        let root = tempfile::tempdir().unwrap();
        let problems = root.path().join("problems").join("add");
        fs::create_dir_all(&problems).unwrap();
        for (id, input, output) in [("1", "1 2", "3"), ("2", "20 22", "42")] {
            fs::write(problems.join(format!("input_{}.txt", id)), input).unwrap();
            fs::write(problems.join(format!("output_{}.txt", id)), output).unwrap();
        }

        let executor = Arc::new(process_executor(&root.path().join("work"), 64));
        let judge = Judge::new(executor, ProblemStore::new(root.path().join("problems")));

        let accepted = judge
            .judge("read a b; echo $((a + b))", Language::Python, "add")
            .await;
        assert!(accepted.is_accepted(), "{:?}", accepted);
        assert_eq!(accepted.passed_cases, 2);

        let wrong = judge
            .judge("read a b; echo $((a * b))", Language::Python, "add")
            .await;
        assert_eq!(wrong.verdict, VerdictCode::WrongAnswer);
        assert_eq!(wrong.failing_case, Some(1));

        let built = judge
            .judge("read a b; echo $((a + b))", Language::Cpp, "add")
            .await;
        assert!(built.is_accepted(), "{:?}", built);

        assert_eq!(fs::read_dir(root.path().join("work")).unwrap().count(), 0);
    }
}
