//! On-disk problem packages.
//!
//! A problem lives in a directory under the problem root:
//!
//! ```text
//! <root>/<data_path>/
//!   problem.yml
//!   tests/1.in  tests/1.out ...
//!   checker/        (optional)
//! ```
//!
//! The manifest carries the resource limits and the ordered test list;
//! the store's problem row only carries approval status and the package
//! location.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// One test case reference: paths relative to the package directory.
#[derive(Debug, Clone, Deserialize)]
pub struct TestFiles {
    #[serde(rename = "in")]
    pub input: String,
    #[serde(rename = "out")]
    pub output: String,
}

/// Parsed `problem.yml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProblemManifest {
    pub id: i64,
    pub title_en: String,
    #[serde(default)]
    pub title_es: String,
    pub difficulty: Difficulty,
    pub base_points: f64,
    pub time_limit_ms: u64,
    /// Wall cap; absent means 2x cpu cap plus one second
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
    pub memory_limit_kib: u64,
    #[serde(default = "default_stdout_cap")]
    pub stdout_cap_bytes: usize,
    #[serde(default)]
    pub samples: Vec<TestFiles>,
    pub tests: Vec<TestFiles>,
    /// Empty means every language is allowed
    #[serde(default)]
    pub languages_allowed: Vec<String>,
    #[serde(default)]
    pub checker: Option<String>,
}

fn default_stdout_cap() -> usize {
    65_536
}

impl ProblemManifest {
    pub fn wall_cap_ms(&self) -> u64 {
        self.wall_time_ms.unwrap_or(self.time_limit_ms * 2 + 1000)
    }

    pub fn allows_language(&self, tag: &str) -> bool {
        self.languages_allowed.is_empty()
            || self
                .languages_allowed
                .iter()
                .any(|l| l.eq_ignore_ascii_case(tag))
    }
}

/// A problem package opened from disk.
#[derive(Debug, Clone)]
pub struct ProblemPackage {
    root: PathBuf,
    pub manifest: ProblemManifest,
}

impl ProblemPackage {
    /// Open and validate the package at `<problem_root>/<data_path>`.
    pub fn load(problem_root: &Path, data_path: &str) -> Result<Self> {
        let root = problem_root.join(data_path);
        let manifest_path = root.join("problem.yml");

        let content = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("missing problem manifest {:?}", manifest_path))?;
        let manifest: ProblemManifest =
            serde_yaml::from_str(&content).context("malformed problem manifest")?;

        if manifest.tests.is_empty() {
            anyhow::bail!("problem {} declares no test cases", manifest.id);
        }
        if manifest.time_limit_ms == 0 || manifest.memory_limit_kib == 0 {
            anyhow::bail!("problem {} has zero resource caps", manifest.id);
        }

        Ok(Self { root, manifest })
    }

    /// Read one test case's input and expected output.
    pub fn read_test(&self, test: &TestFiles) -> Result<(Vec<u8>, Vec<u8>)> {
        let input = std::fs::read(self.root.join(&test.input))
            .with_context(|| format!("missing test input {}", test.input))?;
        let output = std::fs::read(self.root.join(&test.output))
            .with_context(|| format!("missing test output {}", test.output))?;
        Ok((input, output))
    }

    /// Absolute path of the custom checker, if the manifest names one.
    pub fn checker_path(&self) -> Option<PathBuf> {
        self.manifest.checker.as_ref().map(|c| self.root.join(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const MANIFEST: &str = r#"
id: 42
title_en: "Add Two Numbers"
title_es: "Sumar Dos Numeros"
difficulty: easy
base_points: 1000
time_limit_ms: 1000
memory_limit_kib: 65536
stdout_cap_bytes: 4096
samples:
  - { in: tests/1.in, out: tests/1.out }
tests:
  - { in: tests/1.in, out: tests/1.out }
  - { in: tests/2.in, out: tests/2.out }
languages_allowed: [python, cpp]
"#;

    fn write_package(dir: &Path) {
        fs::create_dir_all(dir.join("p42/tests")).unwrap();
        fs::write(dir.join("p42/problem.yml"), MANIFEST).unwrap();
        fs::write(dir.join("p42/tests/1.in"), "3 4\n").unwrap();
        fs::write(dir.join("p42/tests/1.out"), "7\n").unwrap();
        fs::write(dir.join("p42/tests/2.in"), "1 2\n").unwrap();
        fs::write(dir.join("p42/tests/2.out"), "3\n").unwrap();
    }

    #[test]
    fn test_load_package() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path());

        let pkg = ProblemPackage::load(dir.path(), "p42").unwrap();
        assert_eq!(pkg.manifest.id, 42);
        assert_eq!(pkg.manifest.difficulty, Difficulty::Easy);
        assert_eq!(pkg.manifest.tests.len(), 2);
        assert_eq!(pkg.manifest.wall_cap_ms(), 3000);

        let (input, output) = pkg.read_test(&pkg.manifest.tests[0]).unwrap();
        assert_eq!(input, b"3 4\n");
        assert_eq!(output, b"7\n");
    }

    #[test]
    fn test_language_gate() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path());

        let pkg = ProblemPackage::load(dir.path(), "p42").unwrap();
        assert!(pkg.manifest.allows_language("python"));
        assert!(pkg.manifest.allows_language("CPP"));
        assert!(!pkg.manifest.allows_language("go"));
    }

    #[test]
    fn test_empty_allow_list_allows_all() {
        let manifest: ProblemManifest = serde_yaml::from_str(
            r#"
id: 1
title_en: t
difficulty: medium
base_points: 10
time_limit_ms: 500
memory_limit_kib: 32768
tests:
  - { in: tests/1.in, out: tests/1.out }
"#,
        )
        .unwrap();
        assert!(manifest.allows_language("rust"));
        assert_eq!(manifest.stdout_cap_bytes, 65_536);
    }

    #[test]
    fn test_missing_manifest_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProblemPackage::load(dir.path(), "nope").is_err());
    }

    #[test]
    fn test_missing_test_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path());
        fs::remove_file(dir.path().join("p42/tests/2.out")).unwrap();

        let pkg = ProblemPackage::load(dir.path(), "p42").unwrap();
        assert!(pkg.read_test(&pkg.manifest.tests[1]).is_err());
    }
}
