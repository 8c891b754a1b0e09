//! Problem test-case storage.
//!
//! A problem is a directory under the problems root holding paired files
//! `input_<id>[.ext]` / `output_<id>[.ext]`. The case set is discovered by
//! listing inputs; every input must have its output.

use prajna_common::types::TestCase;
use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const INPUT_PREFIX: &str = "input_";
const OUTPUT_PREFIX: &str = "output_";

#[derive(Debug, thiserror::Error)]
pub enum ProblemError {
    #[error("invalid problem id '{0}'")]
    InvalidId(String),
    #[error("problem directory not found: {0}")]
    Missing(PathBuf),
    #[error("no test cases found for problem '{0}'")]
    Empty(String),
    #[error("missing output file for {0}")]
    MissingOutput(String),
    #[error("failed to read test data {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Judging order: numeric ids by value, before any non-numeric id, which
/// sort lexicographically.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CaseKey {
    Numeric(u64),
    Text(String),
}

impl CaseKey {
    fn parse(id: &str) -> Self {
        match id.parse::<u64>() {
            Ok(n) => CaseKey::Numeric(n),
            Err(_) => CaseKey::Text(id.to_string()),
        }
    }
}

impl Ord for CaseKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (CaseKey::Numeric(a), CaseKey::Numeric(b)) => a.cmp(b),
            (CaseKey::Numeric(_), CaseKey::Text(_)) => Ordering::Less,
            (CaseKey::Text(_), CaseKey::Numeric(_)) => Ordering::Greater,
            (CaseKey::Text(a), CaseKey::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for CaseKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Read-only view over the problems root, shared by every judge.
#[derive(Debug, Clone)]
pub struct ProblemStore {
    root: PathBuf,
}

impl ProblemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Only `[A-Za-z0-9_-]`, so an id can never leave the root.
    pub fn validate_id(problem_id: &str) -> Result<(), ProblemError> {
        let valid = !problem_id.is_empty()
            && problem_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(())
        } else {
            Err(ProblemError::InvalidId(problem_id.to_string()))
        }
    }

    /// Load every case of `problem_id` in judging order, ordinals from 1.
    pub async fn load_cases(&self, problem_id: &str) -> Result<Vec<TestCase>, ProblemError> {
        Self::validate_id(problem_id)?;

        let dir = self.root.join(problem_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProblemError::Missing(dir));
            }
            Err(source) => return Err(ProblemError::Read { path: dir, source }),
        };

        let read_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ProblemError::Read { path, source }
        };

        let mut inputs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err(&dir))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(INPUT_PREFIX) else {
                continue;
            };
            if rest.is_empty() || !entry.file_type().await.map_err(read_err(&dir))?.is_file() {
                continue;
            }
            let id = Path::new(rest)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| rest.to_string());
            inputs.push((CaseKey::parse(&id), id, name));
        }

        if inputs.is_empty() {
            return Err(ProblemError::Empty(problem_id.to_string()));
        }

        inputs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.cmp(&b.2)));

        let mut cases = Vec::with_capacity(inputs.len());
        for (index, (_, id, input_name)) in inputs.into_iter().enumerate() {
            let input_path = dir.join(&input_name);
            let output_path = dir.join(format!("{}{}", OUTPUT_PREFIX, &input_name[INPUT_PREFIX.len()..]));

            if !tokio::fs::try_exists(&output_path)
                .await
                .map_err(read_err(&output_path))?
            {
                return Err(ProblemError::MissingOutput(input_name));
            }

            let input = tokio::fs::read_to_string(&input_path)
                .await
                .map_err(read_err(&input_path))?;
            let expected = tokio::fs::read_to_string(&output_path)
                .await
                .map_err(read_err(&output_path))?;

            cases.push(TestCase {
                ordinal: index as u32 + 1,
                id,
                input: format!("{}\n", input.trim_end()),
                expected_output: expected.trim().to_string(),
            });
        }

        debug!(problem_id, total_cases = cases.len(), "Loaded test cases");
        Ok(cases)
    }
}
