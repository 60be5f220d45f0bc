//! Language table: per-language compile and run recipes.
//!
//! The set of supported languages is a closed enum; everything that varies
//! per language (file naming, commands, resource allowances) is data loaded
//! from the embedded `languages.toml`, so adding a language is a table edit
//! plus one enum variant.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    Cpp,
    Rust,
    JavaScript,
    Go,
}

impl Language {
    pub fn tag(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::JavaScript => "javascript",
            Language::Go => "go",
        }
    }

    fn from_table_key(key: &str) -> Option<Self> {
        match key {
            "python" => Some(Language::Python),
            "cpp" => Some(Language::Cpp),
            "rust" => Some(Language::Rust),
            "javascript" => Some(Language::JavaScript),
            "go" => Some(Language::Go),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Recipe for one language.
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    /// Name of the source file inside the workspace (e.g. "main.cpp")
    pub source_file: String,
    /// Compile command, None for interpreted languages
    pub compile_command: Option<Vec<String>>,
    /// Run command
    pub run_command: Vec<String>,
    /// Additive cpu allowance on top of the problem cap (interpreter startup)
    pub extra_cpu_ms: u64,
    /// Additive memory allowance on top of the problem cap (runtime overhead)
    pub extra_mem_kib: u64,
}

impl LanguageSpec {
    /// Effective cpu cap for the run phase.
    pub fn run_cpu_ms(&self, problem_cap_ms: u64) -> u64 {
        problem_cap_ms + self.extra_cpu_ms
    }

    /// Effective memory cap for the run phase.
    pub fn run_mem_kib(&self, problem_cap_kib: u64) -> u64 {
        problem_cap_kib + self.extra_mem_kib
    }
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    extra_cpu_ms: u64,
    #[serde(default)]
    extra_mem_kib: u64,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Parsed language table with alias resolution.
#[derive(Debug)]
pub struct LanguageTable {
    specs: HashMap<Language, LanguageSpec>,
    aliases: HashMap<String, Language>,
}

impl LanguageTable {
    /// Load the embedded language table.
    pub fn load() -> Result<Self> {
        Self::parse(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/files/languages.toml"
        )))
    }

    fn parse(content: &str) -> Result<Self> {
        let raw: HashMap<String, RawSpec> =
            toml::from_str(content).context("malformed language table")?;

        let mut specs = HashMap::new();
        let mut aliases = HashMap::new();

        for (key, raw) in raw {
            let lang = Language::from_table_key(&key)
                .with_context(|| format!("unknown language in table: {}", key))?;

            aliases.insert(key.to_lowercase(), lang);
            for alias in &raw.aliases {
                aliases.insert(alias.to_lowercase(), lang);
            }

            specs.insert(
                lang,
                LanguageSpec {
                    source_file: raw.source_file,
                    compile_command: raw.compile_command.as_deref().map(into_command),
                    run_command: into_command(&raw.run_command),
                    extra_cpu_ms: raw.extra_cpu_ms,
                    extra_mem_kib: raw.extra_mem_kib,
                },
            );
        }

        Ok(Self { specs, aliases })
    }

    /// Resolve a language tag (or alias) from a submission row.
    pub fn resolve(&self, tag: &str) -> Option<Language> {
        self.aliases.get(&tag.to_lowercase()).copied()
    }

    /// Recipe for a language known to be in the table.
    pub fn spec(&self, lang: Language) -> &LanguageSpec {
        &self.specs[&lang]
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_table_loads_all_languages() {
        let table = LanguageTable::load().unwrap();
        for lang in [
            Language::Python,
            Language::Cpp,
            Language::Rust,
            Language::JavaScript,
            Language::Go,
        ] {
            let spec = table.spec(lang);
            assert!(!spec.source_file.is_empty());
            assert!(!spec.run_command.is_empty());
        }
    }

    #[test]
    fn test_compiled_languages_have_compile_commands() {
        let table = LanguageTable::load().unwrap();
        assert!(table.spec(Language::Cpp).compile_command.is_some());
        assert!(table.spec(Language::Rust).compile_command.is_some());
        assert!(table.spec(Language::Go).compile_command.is_some());
        assert!(table.spec(Language::Python).compile_command.is_none());
        assert!(table.spec(Language::JavaScript).compile_command.is_none());
    }

    #[test]
    fn test_alias_resolution() {
        let table = LanguageTable::load().unwrap();
        assert_eq!(table.resolve("py"), Some(Language::Python));
        assert_eq!(table.resolve("PYTHON3"), Some(Language::Python));
        assert_eq!(table.resolve("c++"), Some(Language::Cpp));
        assert_eq!(table.resolve("node"), Some(Language::JavaScript));
        assert_eq!(table.resolve("fortran"), None);
    }

    #[test]
    fn test_allowances_are_additive() {
        let table = LanguageTable::parse(
            r#"
[python]
source_file = "main.py"
run_command = "python3 main.py"
extra_cpu_ms = 2000
extra_mem_kib = 32768
"#,
        )
        .unwrap();

        let spec = table.spec(Language::Python);
        assert_eq!(spec.run_cpu_ms(1000), 3000);
        assert_eq!(spec.run_mem_kib(65536), 98304);
    }

    #[test]
    fn test_unknown_language_key_rejected() {
        let err = LanguageTable::parse(
            r#"
[cobol]
source_file = "main.cob"
run_command = "cobc main.cob"
"#,
        );
        assert!(err.is_err());
    }
}
