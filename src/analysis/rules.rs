//! Detector tables for the static analyzer.
//!
//! Each detector is a `(pattern, severity, message)` row. Adding a detector
//! means adding a row; the scanner in [`super`] treats every row the same.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use super::report::Severity;

pub struct Detector {
    pub pattern: &'static str,
    pub severity: Severity,
    pub message: &'static str,
}

/// Applied to every input regardless of language.
pub const CODE_DETECTORS: &[Detector] = &[
    Detector {
        pattern: r"\beval\s*\(",
        severity: Severity::Critical,
        message: "Use of eval() allows arbitrary code execution",
    },
    Detector {
        pattern: r"\bnew\s+Function\s*\(",
        severity: Severity::Critical,
        message: "Dynamic function construction with new Function()",
    },
    Detector {
        pattern: r"\bchild_process\b",
        severity: Severity::Critical,
        message: "Subprocess module (child_process) referenced",
    },
    Detector {
        pattern: r"(?:^|[^.\w$])(?:exec|execSync|execFile|execFileSync|spawn|spawnSync)\s*\(",
        severity: Severity::Critical,
        message: "Subprocess invocation",
    },
    Detector {
        pattern: r#"\bset(?:Timeout|Interval)\s*\(\s*["'`]"#,
        severity: Severity::High,
        message: "String passed to setTimeout/setInterval is evaluated as code",
    },
    Detector {
        pattern: r#"\brequire\s*\(\s*[^"'`\s)]"#,
        severity: Severity::High,
        message: "Dynamic require() with a non-literal module name",
    },
    Detector {
        pattern: r"\bimport\s*\(",
        severity: Severity::High,
        message: "Dynamic import() loads code at runtime",
    },
    Detector {
        pattern: r"\.(?:inner|outer)HTML\s*\+?=(?:[^=]|$)",
        severity: Severity::High,
        message: "Assignment to innerHTML/outerHTML (DOM XSS sink)",
    },
    Detector {
        pattern: r"\bdocument\.write(?:ln)?\s*\(",
        severity: Severity::High,
        message: "document.write() is a DOM XSS sink",
    },
    Detector {
        pattern: r"__proto__",
        severity: Severity::High,
        message: "Prototype pollution marker (__proto__)",
    },
    Detector {
        pattern: r#"\bconstructor\s*(?:\.\s*prototype\b|\[\s*["']prototype["']\s*\])|\bObject\.prototype\s*\["#,
        severity: Severity::High,
        message: "Prototype pollution marker (prototype mutation)",
    },
    Detector {
        pattern: r"\bnew\s+Buffer\s*\(",
        severity: Severity::Medium,
        message: "Deprecated unsafe Buffer constructor; use Buffer.alloc or Buffer.from",
    },
    Detector {
        pattern: r#"(?i)\bcreateHash\s*\(\s*["'](?:md5|sha1)["']"#,
        severity: Severity::Medium,
        message: "Weak hash algorithm (MD5/SHA-1)",
    },
    Detector {
        pattern: r#"(?i)(?:password|passwd|secret|api[_-]?key|access[_-]?token|auth[_-]?token|private[_-]?key|token)\w*["']?\s*[:=]\s*["'][^"']{4,}["']"#,
        severity: Severity::High,
        message: "Possible hardcoded secret",
    },
    Detector {
        pattern: r"\b(?:TODO|FIXME|HACK|XXX)\b",
        severity: Severity::Info,
        message: "Review marker comment",
    },
];

/// Applied when the language is SQL or the text looks like a query.
pub const SQL_DETECTORS: &[Detector] = &[
    Detector {
        pattern: r"--\s*$",
        severity: Severity::High,
        message: "Trailing SQL comment marker can truncate the rest of a query",
    },
    Detector {
        pattern: r"(?i)\b(?:DROP\s+(?:TABLE|DATABASE)|TRUNCATE\s+TABLE|DELETE\s+FROM)\b",
        severity: Severity::High,
        message: "Destructive SQL statement",
    },
    Detector {
        pattern: r"(?i)'\s*OR\s+'?1'?\s*=\s*'?1",
        severity: Severity::Critical,
        message: "Classic tautology injection (' OR 1=1)",
    },
    Detector {
        pattern: r"(?i)\bUNION\s+(?:ALL\s+)?SELECT\b",
        severity: Severity::High,
        message: "UNION-based query injection",
    },
];

/// Case-insensitive query verbs that switch on the SQL detectors for any
/// language.
const SQL_SNIFF_PATTERN: &str = r"(?i)select|insert|update|delete";

pub struct CompiledDetector {
    pub regex: Regex,
    pub severity: Severity,
    pub message: &'static str,
}

fn compile(table: &[Detector]) -> Vec<CompiledDetector> {
    table
        .iter()
        .filter_map(|detector| match Regex::new(detector.pattern) {
            Ok(regex) => Some(CompiledDetector {
                regex,
                severity: detector.severity,
                message: detector.message,
            }),
            Err(e) => {
                warn!(pattern = detector.pattern, error = %e, "skipping invalid detector");
                None
            }
        })
        .collect()
}

pub fn code_detectors() -> &'static [CompiledDetector] {
    static COMPILED: OnceLock<Vec<CompiledDetector>> = OnceLock::new();
    COMPILED.get_or_init(|| compile(CODE_DETECTORS))
}

pub fn sql_detectors() -> &'static [CompiledDetector] {
    static COMPILED: OnceLock<Vec<CompiledDetector>> = OnceLock::new();
    COMPILED.get_or_init(|| compile(SQL_DETECTORS))
}

pub fn looks_like_sql(code: &str) -> bool {
    static SNIFF: OnceLock<Option<Regex>> = OnceLock::new();
    SNIFF
        .get_or_init(|| Regex::new(SQL_SNIFF_PATTERN).ok())
        .as_ref()
        .is_some_and(|regex| regex.is_match(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_pattern_compiles() {
        assert_eq!(code_detectors().len(), CODE_DETECTORS.len());
        assert_eq!(sql_detectors().len(), SQL_DETECTORS.len());
        assert!(Regex::new(SQL_SNIFF_PATTERN).is_ok());
    }

    #[test]
    fn test_subprocess_pattern_ignores_method_calls() {
        let detector = &code_detectors()[3];
        assert!(detector.regex.is_match("exec('rm -rf /')"));
        assert!(detector.regex.is_match("const out = execSync(cmd)"));
        assert!(!detector.regex.is_match("/a+/.exec(input)"));
    }

    #[test]
    fn test_sql_sniffing() {
        assert!(looks_like_sql("SELECT * FROM users"));
        assert!(looks_like_sql("state.update(x)"));
        assert!(!looks_like_sql("let total = a + b;"));
    }
}
