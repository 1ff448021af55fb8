use std::sync::Arc;
use std::time::Duration;

use itertools::{EitherOrBoth, Itertools};

use crate::config::GraderConfig;
use crate::domain::{
    Execution, ExecutionStatus, GradeReport, MatchMode, TestCase, TestResult, TestStatus,
};
use crate::environment::ExecutionEnvironment;
use crate::errors::EngineError;
use crate::runner::SandboxRunner;
use crate::store::ExecutionStore;

/// Upper bound on the number of chars per side the similarity ratio
/// considers; the block search is quadratic in this bound.
pub const SIMILARITY_MAX_CHARS: usize = 4 * 1024;

/// Output comparison and scoring. Pure; the sandbox side of grading lives
/// in [`TestRunner`].
#[derive(Clone, Debug)]
pub struct Grader {
    config: GraderConfig,
}

impl Grader {
    pub fn new(config: GraderConfig) -> Self {
        Self { config }
    }

    /// Ratcliff/Obershelp similarity over chars, 0.0–1.0: twice the total
    /// matched length (longest common block, recursing left and right)
    /// over the combined length. Inputs are capped at
    /// [`SIMILARITY_MAX_CHARS`] to bound the quadratic block search when a
    /// submission emits output at the environment's size ceiling.
    pub fn similarity(a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().take(SIMILARITY_MAX_CHARS).collect();
        let b: Vec<char> = b.chars().take(SIMILARITY_MAX_CHARS).collect();
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let matched = matching_total(&a, &b);
        2.0 * matched as f64 / (a.len() + b.len()) as f64
    }

    fn normalize(mode: MatchMode, text: &str) -> String {
        match mode {
            MatchMode::Strict => text.to_string(),
            MatchMode::IgnoreWhitespace => text.split_whitespace().join(" "),
            MatchMode::IgnoreCase => text.trim_end_matches('\n').to_lowercase(),
            MatchMode::Similarity => text.trim_end_matches('\n').to_string(),
        }
    }

    /// Comparison pipeline: exit code, then expected-error substring, then
    /// normalized output (exact in strict mode, similarity ratio
    /// otherwise). Partial credit is proportional to similarity above the
    /// configured cutoff.
    pub fn compare(&self, case: &TestCase, outcome: &Execution) -> TestResult {
        match outcome.status {
            ExecutionStatus::TimedOut => {
                return self.non_passing(
                    case,
                    outcome,
                    TestStatus::TimedOut,
                    "your program exceeded the time limit".to_string(),
                );
            }
            ExecutionStatus::Completed => {}
            _ => {
                let msg = outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "execution did not complete".to_string());
                return self.non_passing(case, outcome, TestStatus::Error, msg);
            }
        }

        let actual_exit = outcome.exit_code.unwrap_or(-1);
        if actual_exit != case.expected_exit_code {
            return self.non_passing(
                case,
                outcome,
                TestStatus::Failed,
                format!(
                    "expected exit code {}, got {}",
                    case.expected_exit_code, actual_exit
                ),
            );
        }

        if let Some(expected_error) = &case.expected_error {
            if !outcome.stderr.contains(expected_error.as_str()) {
                return self.non_passing(
                    case,
                    outcome,
                    TestStatus::Failed,
                    format!("stderr does not contain expected text '{expected_error}'"),
                );
            }
        }

        let expected = Self::normalize(case.match_mode, &case.expected_stdout);
        let actual = Self::normalize(case.match_mode, &outcome.stdout);
        let similarity = Self::similarity(&expected, &actual);

        let passed = match case.match_mode {
            MatchMode::Strict => expected == actual,
            _ => expected == actual || similarity >= self.config.similarity_threshold,
        };

        let points_earned = if passed {
            case.weight
        } else if similarity > self.config.partial_credit_cutoff {
            case.weight * similarity
        } else {
            0.0
        };

        let (status, feedback, diff) = if passed {
            (TestStatus::Passed, "passed".to_string(), String::new())
        } else {
            (
                TestStatus::Failed,
                format!("output did not match expected (similarity {similarity:.2})"),
                line_diff(&case.expected_stdout, &outcome.stdout),
            )
        };

        TestResult {
            test_case_id: case.id,
            test_name: case.name.clone(),
            status,
            actual_stdout: outcome.stdout.clone(),
            actual_stderr: outcome.stderr.clone(),
            actual_exit_code: outcome.exit_code,
            similarity,
            points_earned,
            points_possible: case.weight,
            diff,
            feedback,
        }
    }

    fn non_passing(
        &self,
        case: &TestCase,
        outcome: &Execution,
        status: TestStatus,
        feedback: String,
    ) -> TestResult {
        TestResult {
            test_case_id: case.id,
            test_name: case.name.clone(),
            status,
            actual_stdout: outcome.stdout.clone(),
            actual_stderr: outcome.stderr.clone(),
            actual_exit_code: outcome.exit_code,
            similarity: 0.0,
            points_earned: 0.0,
            points_possible: case.weight,
            diff: String::new(),
            feedback,
        }
    }

    fn host_error(&self, case: &TestCase, message: &str) -> TestResult {
        TestResult {
            test_case_id: case.id,
            test_name: case.name.clone(),
            status: TestStatus::Error,
            actual_stdout: String::new(),
            actual_stderr: String::new(),
            actual_exit_code: None,
            similarity: 0.0,
            points_earned: 0.0,
            points_possible: case.weight,
            diff: String::new(),
            feedback: message.to_string(),
        }
    }

    pub fn aggregate(results: Vec<TestResult>) -> GradeReport {
        let total_tests = results.len();
        let passed = results
            .iter()
            .filter(|r| r.status == TestStatus::Passed)
            .count();
        let total_points: f64 = results.iter().map(|r| r.points_possible).sum();
        let earned_points: f64 = results.iter().map(|r| r.points_earned).sum();
        let percentage = if total_points > 0.0 {
            earned_points / total_points * 100.0
        } else {
            0.0
        };
        GradeReport {
            total_tests,
            passed,
            failed: total_tests - passed,
            total_points,
            earned_points,
            percentage,
            results,
        }
    }
}

fn matching_total(a: &[char], b: &[char]) -> usize {
    let (i, j, len) = longest_common_block(a, b);
    if len == 0 {
        return 0;
    }
    len + matching_total(&a[..i], &b[..j]) + matching_total(&a[i + len..], &b[j + len..])
}

/// Longest common substring via a rolling-row table; returns (start in a,
/// start in b, length).
fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        let mut row = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let run = prev[j] + 1;
                row[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            }
        }
        prev = row;
    }
    best
}

fn line_diff(expected: &str, actual: &str) -> String {
    expected
        .lines()
        .zip_longest(actual.lines())
        .enumerate()
        .filter_map(|(i, pair)| match pair {
            EitherOrBoth::Both(e, a) if e == a => None,
            EitherOrBoth::Both(e, a) => {
                Some(format!("line {}: expected `{}`, got `{}`", i + 1, e, a))
            }
            EitherOrBoth::Left(e) => Some(format!("line {}: missing `{}`", i + 1, e)),
            EitherOrBoth::Right(a) => Some(format!("line {}: unexpected `{}`", i + 1, a)),
        })
        .join("\n")
}

/// Re-runs a submission once per test case, each in its own sandbox so one
/// test's resource usage cannot corrupt another's measurement. Test cases
/// run sequentially in their defined order; the report is assembled only
/// after all of them finish.
#[derive(Debug)]
pub struct TestRunner {
    runner: Arc<SandboxRunner>,
    store: Arc<ExecutionStore>,
    grader: Grader,
}

impl TestRunner {
    pub fn new(runner: Arc<SandboxRunner>, store: Arc<ExecutionStore>, grader: Grader) -> Self {
        Self {
            runner,
            store,
            grader,
        }
    }

    #[tracing::instrument(skip_all, fields(submission = %submission.id))]
    pub async fn grade_all(
        &self,
        submission: &Execution,
        env: &ExecutionEnvironment,
        cases: &[TestCase],
    ) -> Result<GradeReport, EngineError> {
        let ordered = cases
            .iter()
            .filter(|c| c.active)
            .sorted_by_key(|c| c.order);

        let mut results = Vec::new();
        for case in ordered {
            let mut case_env = env.clone();
            if let Some(secs) = case.timeout_override_secs {
                case_env.default_timeout = Duration::from_secs(secs);
            }
            if let Some(mb) = case.memory_override_mb {
                case_env.memory_limit_mb = mb;
            }

            let mut child = Execution::new(
                submission.user_id,
                case_env.key(),
                case_env.language.clone(),
                submission.kind,
                submission.source_code.clone(),
            );
            child.stdin = case.input.clone();
            child.argv = submission.argv.clone();
            child.env_vars = submission.env_vars.clone();
            child.exercise_id = submission.exercise_id;
            let child_id = child.id;

            self.store.insert(child);
            self.store.transition(child_id, ExecutionStatus::Queued)?;
            let run = self.runner.execute(child_id, &case_env).await;
            let outcome = self
                .store
                .get(child_id)
                .ok_or(EngineError::ExecutionNotFound(child_id))?;
            // Only the TestResult summary persists.
            self.store.remove(child_id);

            let result = match run {
                Ok(()) => self.grader.compare(case, &outcome),
                // Host-side fault: the test errors instead of being blamed
                // on the learner's code.
                Err(e) => {
                    tracing::error!(test = %case.name, error = %e, "grading run failed host-side");
                    self.grader.host_error(case, &e.to_string())
                }
            };
            results.push(result);
        }

        Ok(Grader::aggregate(results))
    }
}
