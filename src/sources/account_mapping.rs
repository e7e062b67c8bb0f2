//! Classification of profit and loss report lines into metrics
//!
//! Report layouts vary between organisations, so the mapping from account
//! names to metrics comes from configuration (`AccountRule`). Matching is
//! case-insensitive substring matching on section titles and account names.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::AccountRule;
use crate::models::{ExternalRecord, MetricKey};

/// One flattened line of a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    /// Title of the enclosing section, empty for top-level rows
    pub section: String,
    pub account: String,
    pub amount: Decimal,
    /// Section summary row ("Total Income")
    pub is_total: bool,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    metric: MetricKey,
    section: Option<String>,
    accounts: Vec<String>,
}

impl CompiledRule {
    fn section_matches(&self, line: &ReportLine) -> bool {
        match &self.section {
            Some(section) => line.section.to_lowercase().contains(section),
            None => true,
        }
    }

    fn account_matches(&self, line: &ReportLine) -> bool {
        let account = line.account.to_lowercase();
        self.accounts.iter().any(|a| account.contains(a))
    }
}

/// Applies the configured account rules to report lines
#[derive(Debug, Clone)]
pub struct AccountMapper {
    rules: Vec<CompiledRule>,
}

impl AccountMapper {
    pub fn new(rules: &[AccountRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| CompiledRule {
                metric: MetricKey::new(rule.metric.clone()),
                section: rule.section.as_ref().map(|s| s.trim().to_lowercase()),
                accounts: rule
                    .accounts
                    .iter()
                    .map(|a| a.trim().to_lowercase())
                    .filter(|a| !a.is_empty())
                    .collect(),
            })
            .collect();
        Self { rules }
    }

    /// Turn report lines into records stamped `at`.
    ///
    /// Section-total rules contribute one record per matching section.
    /// Account rules contribute one record per matching non-total line. A
    /// line claimed by account rules of different metrics counts toward each
    /// of them and is reported as ambiguous.
    pub fn classify(&self, lines: &[ReportLine], at: DateTime<Utc>) -> Vec<ExternalRecord> {
        let mut records = Vec::new();

        for rule in self.rules.iter().filter(|r| r.accounts.is_empty()) {
            records.extend(
                section_totals(lines, rule)
                    .into_iter()
                    .map(|amount| ExternalRecord::new(rule.metric.clone(), amount, at)),
            );
        }

        for line in lines.iter().filter(|l| !l.is_total) {
            let mut claimed: Vec<&MetricKey> = Vec::new();
            for rule in self.rules.iter().filter(|r| !r.accounts.is_empty()) {
                if rule.section_matches(line) && rule.account_matches(line) {
                    if claimed.contains(&&rule.metric) {
                        continue;
                    }
                    claimed.push(&rule.metric);
                    records.push(ExternalRecord::new(rule.metric.clone(), line.amount, at));
                }
            }

            if claimed.len() > 1 {
                let metrics: Vec<&str> = claimed.iter().map(|m| m.as_str()).collect();
                tracing::warn!(
                    "Account '{}' in section '{}' matched several metrics: {}",
                    line.account,
                    line.section,
                    metrics.join(", ")
                );
            }
        }

        records
    }
}

/// Totals of every section a rule selects. Sections without a summary row
/// fall back to the sum of their lines.
fn section_totals(lines: &[ReportLine], rule: &CompiledRule) -> Vec<Decimal> {
    let mut sections: Vec<&str> = Vec::new();
    for line in lines {
        if !line.section.is_empty()
            && rule.section_matches(line)
            && !sections.contains(&line.section.as_str())
        {
            sections.push(&line.section);
        }
    }

    sections
        .into_iter()
        .map(|section| {
            let in_section = lines.iter().filter(|l| l.section == section);
            match in_section.clone().find(|l| l.is_total) {
                Some(total) => total.amount,
                None => in_section.map(|l| l.amount).sum(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_account_rules;
    use chrono::TimeZone;

    fn line(section: &str, account: &str, amount: &str, is_total: bool) -> ReportLine {
        ReportLine {
            section: section.to_string(),
            account: account.to_string(),
            amount: amount.parse().unwrap(),
            is_total,
        }
    }

    fn sample_report() -> Vec<ReportLine> {
        vec![
            line("Income", "Construction Sales", "12000.00", false),
            line("Income", "Other Revenue", "500.00", false),
            line("Income", "Total Income", "12500.00", true),
            line("Less Cost of Sales", "Materials - Lumber", "3000.00", false),
            line("Less Cost of Sales", "Subcontractors", "4000.00", false),
            line("Less Cost of Sales", "Equipment Rental", "250.00", false),
            line("Less Cost of Sales", "Total Cost of Sales", "7250.00", true),
            line("", "Net Profit", "5250.00", false),
        ]
    }

    fn total_for(records: &[ExternalRecord], key: &str) -> Decimal {
        records
            .iter()
            .filter(|r| r.category.as_str() == key)
            .map(|r| r.amount)
            .sum()
    }

    #[test]
    fn test_default_rules_classify_sample_report() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mapper = AccountMapper::new(&default_account_rules());
        let records = mapper.classify(&sample_report(), at);

        assert_eq!(total_for(&records, "revenue"), Decimal::from(12500));
        assert_eq!(total_for(&records, "cost-of-goods"), Decimal::from(7250));
        assert_eq!(total_for(&records, "materials"), Decimal::from(3000));
        assert_eq!(total_for(&records, "subcontracted-labor"), Decimal::from(4000));
        assert_eq!(total_for(&records, "net-profit"), Decimal::from(5250));
        assert!(records.iter().all(|r| r.timestamp == at));
    }

    #[test]
    fn test_section_without_summary_row_sums_lines() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let lines = vec![
            line("Income", "Sales", "100.00", false),
            line("Income", "Interest", "2.50", false),
        ];
        let mapper = AccountMapper::new(&default_account_rules());
        let records = mapper.classify(&lines, at);

        assert_eq!(total_for(&records, "revenue"), "102.50".parse().unwrap());
    }

    #[test]
    fn test_ambiguous_line_counts_once_per_metric() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let lines = vec![line(
            "Less Cost of Sales",
            "Subcontracted Material Install",
            "800.00",
            false,
        )];
        let mapper = AccountMapper::new(&default_account_rules());
        let records = mapper.classify(&lines, at);

        assert_eq!(total_for(&records, "materials"), Decimal::from(800));
        assert_eq!(total_for(&records, "subcontracted-labor"), Decimal::from(800));
    }

    #[test]
    fn test_section_filter_excludes_other_sections() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let lines = vec![
            line("Operating Expenses", "Office Materials", "60.00", false),
            line("Less Cost of Sales", "Site Materials", "900.00", false),
        ];
        let mapper = AccountMapper::new(&default_account_rules());
        let records = mapper.classify(&lines, at);

        assert_eq!(total_for(&records, "materials"), Decimal::from(900));
    }

    #[test]
    fn test_multiple_rules_for_one_metric_do_not_double_count() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let rules = vec![
            AccountRule {
                metric: "materials".to_string(),
                label: "Materials".to_string(),
                section: None,
                accounts: vec!["material".to_string()],
            },
            AccountRule {
                metric: "materials".to_string(),
                label: "Materials".to_string(),
                section: None,
                accounts: vec!["lumber".to_string()],
            },
        ];
        let lines = vec![line("Less Cost of Sales", "Materials - Lumber", "3000.00", false)];
        let records = AccountMapper::new(&rules).classify(&lines, at);

        assert_eq!(records.len(), 1);
    }
}
