//! Pattern-based static risk analysis.
//!
//! Pure and stateless: the same code and language always produce the same
//! report. Nothing here executes the code it inspects.

mod report;
mod rules;

pub use report::{RiskLevel, SecurityAnalysisReport, SecurityFinding, Severity};
pub use rules::{Detector, CODE_DETECTORS, SQL_DETECTORS};

use rules::{code_detectors, looks_like_sql, sql_detectors, CompiledDetector};

/// Language assumed when a caller does not name one
pub const DEFAULT_LANGUAGE: &str = "javascript";

/// Longest excerpt kept for a finding, in characters
pub const MAX_EXCERPT_CHARS: usize = 100;

/// Upper bound of the risk score
pub const MAX_RISK_SCORE: u32 = 100;

/// Scan `code` line by line and score what the detectors find.
pub fn analyze(code: &str, language: &str) -> SecurityAnalysisReport {
    let language = language.trim().to_lowercase();

    let mut detectors: Vec<&CompiledDetector> = code_detectors().iter().collect();
    if language == "sql" || looks_like_sql(code) {
        detectors.extend(sql_detectors());
    }

    let mut findings = Vec::new();
    let mut lines_analyzed = 0;
    for (index, line) in code.lines().enumerate() {
        lines_analyzed += 1;
        for detector in &detectors {
            if detector.regex.is_match(line) {
                findings.push(SecurityFinding {
                    line: index + 1,
                    severity: detector.severity,
                    message: detector.message.to_string(),
                    excerpt: excerpt(line),
                });
            }
        }
    }

    let risk_score = risk_score(&findings);
    SecurityAnalysisReport {
        language,
        lines_analyzed,
        finding_count: findings.len(),
        findings,
        risk_score,
        risk_level: RiskLevel::from_score(risk_score),
    }
}

/// Severity-weighted sum of `findings`, capped at [`MAX_RISK_SCORE`].
pub fn risk_score(findings: &[SecurityFinding]) -> u32 {
    findings
        .iter()
        .map(|finding| finding.severity.weight())
        .fold(0u32, u32::saturating_add)
        .min(MAX_RISK_SCORE)
}

fn excerpt(line: &str) -> String {
    line.trim().chars().take(MAX_EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_is_critical() {
        let report = analyze("const x = 1;\nconst y = eval(userInput);", "javascript");
        assert_eq!(report.finding_count, 1);
        let finding = &report.findings[0];
        assert_eq!(finding.line, 2);
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.message.contains("eval"));
        assert_eq!(finding.excerpt, "const y = eval(userInput);");
        assert!(report.risk_score >= 10);
        assert!(report.risk_level >= RiskLevel::Low);
    }

    #[test]
    fn test_clean_code_is_safe() {
        let report = analyze("function add(a, b) {\n  return a + b;\n}\n", "javascript");
        assert_eq!(report.lines_analyzed, 3);
        assert!(report.findings.is_empty());
        assert_eq!(report.risk_score, 0);
        assert_eq!(report.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn test_trailing_sql_comment_in_javascript() {
        let code = "const q = \"SELECT * FROM users WHERE name = '\" + name + \"' --";
        let report = analyze(code, "javascript");
        assert!(report
            .findings
            .iter()
            .any(|f| f.message.contains("Trailing SQL comment")));
    }

    #[test]
    fn test_sql_detectors_need_sql_context() {
        let report = analyze("counter--", "javascript");
        assert!(report.findings.is_empty());

        let report = analyze("counter--", "sql");
        assert_eq!(report.finding_count, 1);
        assert_eq!(report.findings[0].severity, Severity::High);
    }

    #[test]
    fn test_sql_injection_patterns() {
        let code = "SELECT * FROM users WHERE id = '' OR 1=1\n\
                    SELECT name FROM a UNION ALL SELECT password FROM users\n\
                    DROP TABLE users;";
        let report = analyze(code, "sql");
        let by_line: Vec<(usize, Severity)> =
            report.findings.iter().map(|f| (f.line, f.severity)).collect();
        assert!(by_line.contains(&(1, Severity::Critical)));
        assert!(by_line.contains(&(2, Severity::High)));
        assert!(by_line.contains(&(3, Severity::High)));
    }

    #[test]
    fn test_every_line_is_matched_independently() {
        let code = "eval(a)\neval(b)\neval(c)";
        let report = analyze(code, "javascript");
        let lines: Vec<usize> = report.findings.iter().map(|f| f.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
        assert_eq!(report.risk_score, 30);
        assert_eq!(report.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_score_is_capped() {
        let code = "eval(x); new Function('y');\n".repeat(50);
        let report = analyze(&code, "javascript");
        assert_eq!(report.finding_count, 100);
        assert_eq!(report.risk_score, MAX_RISK_SCORE);
        assert_eq!(report.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_excerpt_is_truncated() {
        let line = format!("    eval({})", "a".repeat(300));
        let report = analyze(&line, "javascript");
        let excerpt = &report.findings[0].excerpt;
        assert_eq!(excerpt.chars().count(), MAX_EXCERPT_CHARS);
        assert!(excerpt.starts_with("eval("));
    }

    #[test]
    fn test_other_detectors() {
        let cases = [
            ("setTimeout(\"alert(1)\", 10)", Severity::High),
            ("const mod = require(name)", Severity::High),
            ("el.innerHTML = userInput", Severity::High),
            ("obj.__proto__.isAdmin = true", Severity::High),
            ("const b = new Buffer(10)", Severity::Medium),
            ("crypto.createHash('md5')", Severity::Medium),
            ("const apiKey = \"sk-live-1234\"", Severity::High),
            ("// TODO: sanitize", Severity::Info),
        ];
        for (code, severity) in cases {
            let report = analyze(code, "javascript");
            assert!(
                report.findings.iter().any(|f| f.severity == severity),
                "{code}: {:?}",
                report.findings
            );
        }

        let report = analyze("const m = require('fs')", "javascript");
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_report_is_deterministic() {
        let code = "eval(a) // TODO\nSELECT 1 --";
        assert_eq!(analyze(code, "javascript"), analyze(code, "javascript"));
    }

    #[test]
    fn test_findings_by_severity() {
        let report = analyze("eval(a) // TODO\nnew Buffer(1)", "javascript");
        let counts = report.findings_by_severity();
        assert_eq!(counts.get(&Severity::Critical), Some(&1));
        assert_eq!(counts.get(&Severity::Info), Some(&1));
        assert_eq!(counts.get(&Severity::Medium), Some(&1));
    }
}
