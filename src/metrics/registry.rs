//! Metric registry
//!
//! Every metric the dashboard shows is declared here once, together with its
//! static stock/flow kind, the family (source) that serves it and the
//! selector that source uses to extract it.

use crate::config::AppConfig;
use crate::models::{MetricDefinition, MetricFamily, MetricKey, MetricKind, Selector};

/// Key of the won-deals flow metric
pub const CLOSED_WON_KEY: &str = "closed-won";

/// Ordered set of metric definitions
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    metrics: Vec<MetricDefinition>,
}

impl MetricRegistry {
    /// Create a registry, keeping the first definition of a duplicated key
    pub fn new(metrics: Vec<MetricDefinition>) -> Self {
        let mut unique: Vec<MetricDefinition> = Vec::with_capacity(metrics.len());
        for metric in metrics {
            if unique.iter().any(|m| m.key == metric.key) {
                tracing::warn!("Duplicate metric key {} ignored", metric.key);
                continue;
            }
            unique.push(metric);
        }
        Self { metrics: unique }
    }

    /// Build the registry for the configured sources
    pub fn from_config(config: &AppConfig) -> Self {
        let mut metrics = Vec::new();

        if let Some(pipeline) = &config.pipeline {
            for stage in &pipeline.stages {
                metrics.push(MetricDefinition {
                    key: MetricKey::new(stage.key.clone()),
                    label: stage.label.clone(),
                    kind: MetricKind::Stock,
                    family: MetricFamily::Pipeline,
                    selector: Selector::DealStage {
                        stage_id: stage.stage_id.clone(),
                        dated: false,
                    },
                });
            }
            metrics.push(MetricDefinition {
                key: MetricKey::from(CLOSED_WON_KEY),
                label: "Closed Won".to_string(),
                kind: MetricKind::Flow,
                family: MetricFamily::Pipeline,
                selector: Selector::DealStage {
                    stage_id: pipeline.closed_won_stage.clone(),
                    dated: true,
                },
            });
        }

        if let Some(financial) = &config.financial {
            // Several rules may feed one metric; the first rule names it
            for rule in &financial.account_rules {
                metrics.push(MetricDefinition {
                    key: MetricKey::new(rule.metric.clone()),
                    label: rule.label.clone(),
                    kind: MetricKind::Flow,
                    family: MetricFamily::Financial,
                    selector: Selector::ReportCategory,
                });
            }
        }

        let mut registry = Self::default();
        for metric in metrics {
            if registry.get(&metric.key).is_none() {
                registry.metrics.push(metric);
            }
        }
        registry
    }

    pub fn get(&self, key: &MetricKey) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| &m.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.metrics.iter()
    }

    /// Metrics of one family, in declaration order
    pub fn family(&self, family: MetricFamily) -> Vec<&MetricDefinition> {
        self.metrics.iter().filter(|m| m.family == family).collect()
    }

    /// Families with at least one metric, in stable order
    pub fn families(&self) -> Vec<MetricFamily> {
        MetricFamily::ALL
            .into_iter()
            .filter(|f| self.metrics.iter().any(|m| m.family == *f))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
