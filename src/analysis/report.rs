use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Contribution of one finding to the risk score
    pub fn weight(self) -> u32 {
        match self {
            Severity::Critical => 10,
            Severity::High => 7,
            Severity::Medium => 4,
            Severity::Low => 2,
            Severity::Info => 1,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 50 => RiskLevel::Critical,
            s if s >= 30 => RiskLevel::High,
            s if s >= 15 => RiskLevel::Medium,
            s if s > 0 => RiskLevel::Low,
            _ => RiskLevel::Safe,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFinding {
    /// 1-based line number
    pub line: usize,
    pub severity: Severity,
    pub message: String,
    /// Trimmed source line, at most 100 characters
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAnalysisReport {
    pub language: String,
    pub lines_analyzed: usize,
    pub findings: Vec<SecurityFinding>,
    pub finding_count: usize,
    /// Severity-weighted sum of findings, capped at 100
    pub risk_score: u32,
    pub risk_level: RiskLevel,
}

impl SecurityAnalysisReport {
    /// Number of findings at each severity that occurred at least once
    pub fn findings_by_severity(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for finding in &self.findings {
            *counts.entry(finding.severity).or_insert(0) += 1;
        }
        counts
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk_level >= RiskLevel::High
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_thresholds() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Safe);
        assert_eq!(RiskLevel::from_score(1), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(14), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(15), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(30), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(49), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(50), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::Critical);
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
        assert!(Severity::Critical > Severity::Info);
    }
}
