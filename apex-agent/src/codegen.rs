use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Rust,
    Python,
    Other,
}

impl Language {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("rs") => Self::Rust,
            Some("py") => Self::Python,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    Caching,
    ErrorHandling,
    Logging,
}

impl OptimizationKind {
    /// Picks an optimization from the free-text reason for a proposal.
    pub fn from_reason(reason: &str) -> Self {
        let reason = reason.to_lowercase();
        if reason.contains("slow") || reason.contains("performance") {
            Self::Caching
        } else if reason.contains("error") {
            Self::ErrorHandling
        } else {
            Self::Logging
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFunction {
    pub name: String,
    pub template_name: String,
    pub language: Language,
    pub code: String,
}

/// A test script that checks a candidate file. The runner writes the candidate under
/// `candidate_file` next to the script before running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub language: Language,
    pub candidate_file: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub quality_score: u32,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub lines_of_code: usize,
}

pub trait CodeGenerator: Send + Sync {
    fn generate_function(&self, purpose: &str, language: Language) -> Result<GeneratedFunction>;
    fn generate_optimization(&self, code: &str, kind: OptimizationKind, language: Language) -> String;
    fn improve_error_handling(&self, code: &str, language: Language) -> String;
    fn refactor(&self, code: &str, reason: &str, language: Language) -> String;
    /// `None` when there is no test for the language; callers treat that as skipped.
    fn generate_test_case(&self, code: &str, language: Language) -> Option<GeneratedTest>;
    fn analyze_code_quality(&self, code: &str, language: Language) -> QualityReport;
}

/// Deterministic textual transforms. No model is involved.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateCodeGenerator;

fn function_name(purpose: &str) -> String {
    let words: Vec<String> = purpose
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() > 3)
        .take(3)
        .map(str::to_ascii_lowercase)
        .collect();
    match words.first() {
        Some(first) if !first.starts_with(|c: char| c.is_ascii_digit()) => words.join("_"),
        _ => "generated_function".to_string(),
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl CodeGenerator for TemplateCodeGenerator {
    fn generate_function(&self, purpose: &str, language: Language) -> Result<GeneratedFunction> {
        let purpose = single_line(purpose);
        if purpose.is_empty() {
            return Err(AgentError::InvalidArguments("purpose must not be empty".to_string()));
        }
        let name = function_name(&purpose);
        let code = match language {
            Language::Rust => format!(
                "/// {purpose}\npub fn {name}(input: &str) -> Result<String, String> {{\n    if input.is_empty() {{\n        return Err(\"{name}: empty input\".to_string());\n    }}\n    Ok(input.to_string())\n}}\n"
            ),
            Language::Python => format!(
                "def {name}(params):\n    \"\"\"{purpose}\"\"\"\n    try:\n        return {{\"status\": \"success\", \"message\": \"Function executed\"}}\n    except Exception as e:\n        return {{\"status\": \"error\", \"error\": str(e)}}\n"
            ),
            Language::Other => format!("{name}: {purpose}\n"),
        };
        let template_name = format!(
            "auto_{name}_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        Ok(GeneratedFunction {
            name,
            template_name,
            language,
            code,
        })
    }

    fn generate_optimization(&self, code: &str, kind: OptimizationKind, language: Language) -> String {
        match (kind, language) {
            (OptimizationKind::ErrorHandling, _) => self.improve_error_handling(code, language),
            (OptimizationKind::Caching, Language::Python) => {
                if code.contains("lru_cache") {
                    code.to_string()
                } else {
                    format!("from functools import lru_cache  # noqa: F401\n{code}")
                }
            }
            (OptimizationKind::Logging, Language::Python) => {
                if code.contains("import logging") {
                    code.to_string()
                } else {
                    format!("import logging\n\nlogger = logging.getLogger(__name__)\n\n{code}")
                }
            }
            (OptimizationKind::Caching, Language::Rust) => {
                format!("// memoization candidate: results here are safe to cache\n{code}")
            }
            (OptimizationKind::Logging, Language::Rust) => {
                format!("// instrument entry and exit of public functions with tracing\n{code}")
            }
            (_, Language::Other) => code.to_string(),
        }
    }

    fn improve_error_handling(&self, code: &str, language: Language) -> String {
        match language {
            Language::Rust => {
                if code.contains("#![deny(unused_must_use)]") {
                    code.to_string()
                } else {
                    format!("#![deny(unused_must_use)]\n{code}")
                }
            }
            Language::Python => {
                let body: String = code.lines().map(|l| format!("    {l}\n")).collect();
                format!(
                    "import logging\n\ntry:\n{body}    pass\nexcept Exception:\n    logging.getLogger(__name__).exception(\"module failed\")\n    raise\n"
                )
            }
            Language::Other => code.to_string(),
        }
    }

    fn refactor(&self, code: &str, reason: &str, language: Language) -> String {
        let reason = single_line(reason);
        match language {
            Language::Rust if !code.trim_start().starts_with("//!") => {
                format!("//! Refactored: {reason}\n\n{code}")
            }
            Language::Python if !code.trim_start().starts_with("\"\"\"") => {
                format!("\"\"\"Refactored: {}\"\"\"\n\n{code}", reason.replace('"', "'"))
            }
            _ => code.to_string(),
        }
    }

    fn generate_test_case(&self, _code: &str, language: Language) -> Option<GeneratedTest> {
        match language {
            Language::Python => Some(GeneratedTest {
                language,
                candidate_file: "candidate.py".to_string(),
                code: "import py_compile\n\npy_compile.compile(\"candidate.py\", doraise=True)\nprint(\"candidate compiles\")\n"
                    .to_string(),
            }),
            Language::Rust | Language::Other => None,
        }
    }

    fn analyze_code_quality(&self, code: &str, language: Language) -> QualityReport {
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();
        let lines: Vec<&str> = code.lines().collect();

        match language {
            Language::Python => {
                for (i, line) in lines.iter().enumerate() {
                    let trimmed = line.trim_start();
                    let Some(rest) = trimmed.strip_prefix("def ") else {
                        continue;
                    };
                    let name = rest.split('(').next().unwrap_or(rest).trim();
                    let documented = lines
                        .get(i + 1)
                        .is_some_and(|next| next.trim_start().starts_with("\"\"\""));
                    if !documented {
                        issues.push(format!("Function '{name}' missing docstring"));
                        suggestions.push(format!("Add docstring to {name}"));
                    }
                }
                if code.contains("except:") {
                    issues.push("Bare except clause found".to_string());
                    suggestions.push("Use specific exception types".to_string());
                }
            }
            Language::Rust => {
                for (i, line) in lines.iter().enumerate() {
                    let trimmed = line.trim_start();
                    let Some(rest) = trimmed.strip_prefix("pub fn ") else {
                        continue;
                    };
                    let name = rest.split(['(', '<']).next().unwrap_or(rest).trim();
                    let documented = i > 0
                        && lines[..i]
                            .iter()
                            .rev()
                            .map(|l| l.trim_start())
                            .find(|l| !l.starts_with("#["))
                            .is_some_and(|l| l.starts_with("///"));
                    if !documented {
                        issues.push(format!("Function '{name}' missing doc comment"));
                        suggestions.push(format!("Add a doc comment to {name}"));
                    }
                }
                let unwraps = code.matches(".unwrap()").count();
                if unwraps > 0 {
                    issues.push(format!("{unwraps} unwrap() calls found"));
                    suggestions.push("Propagate errors with ?".to_string());
                }
            }
            Language::Other => {}
        }

        let todos = code.matches("TODO").count();
        if todos > 0 {
            issues.push(format!("{todos} TODO items found"));
        }

        let penalty = u32::try_from(issues.len()).unwrap_or(u32::MAX).saturating_mul(10);
        QualityReport {
            quality_score: 100u32.saturating_sub(penalty),
            issues,
            suggestions,
            lines_of_code: lines.len(),
        }
    }
}
