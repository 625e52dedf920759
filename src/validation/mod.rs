//! Per-feed record acceptance rules, applied after schema coercion.

use crate::config::ValidationRules;
use crate::schema::TypedRecord;
use crate::utils::error::ValidationError;
use std::sync::Arc;
use tracing::warn;

/// One acceptance check over a coerced record.
pub trait RecordRule: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(reason)` when the record breaks the rule.
    fn check(&self, record: &TypedRecord) -> Result<(), String>;
}

/// Fields that must be present and non-null.
pub struct RequiredFields(pub Vec<String>);

impl RecordRule for RequiredFields {
    fn name(&self) -> &str {
        "required_fields"
    }

    fn check(&self, record: &TypedRecord) -> Result<(), String> {
        let missing = missing_fields(&self.0, record);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing {}", missing.join(", ")))
        }
    }
}

fn missing_fields(required: &[String], record: &TypedRecord) -> Vec<String> {
    required
        .iter()
        .filter(|f| record.get(*f).map_or(true, |v| v.is_null()))
        .cloned()
        .collect()
}

/// Upper bound on the share of null columns in a record.
pub struct MaxNullPercentage(pub f64);

impl RecordRule for MaxNullPercentage {
    fn name(&self) -> &str {
        "max_null_percentage"
    }

    fn check(&self, record: &TypedRecord) -> Result<(), String> {
        if record.is_empty() {
            return Ok(());
        }
        let nulls = record.values().filter(|v| v.is_null()).count();
        let pct = nulls as f64 / record.len() as f64 * 100.0;
        if pct > self.0 {
            Err(format!("{pct:.1}% null fields exceeds {:.1}%", self.0))
        } else {
            Ok(())
        }
    }
}

pub struct DataValidator {
    feed: String,
    enabled: bool,
    strict: bool,
    required: Vec<String>,
    rules: Vec<Arc<dyn RecordRule>>,
}

impl DataValidator {
    pub fn new(feed: impl Into<String>, config: &ValidationRules) -> Self {
        Self {
            feed: feed.into(),
            enabled: config.enabled,
            strict: config.strict_mode,
            required: config.required_fields.clone(),
            rules: vec![Arc::new(MaxNullPercentage(config.max_null_percentage))],
        }
    }

    /// Accepts everything.
    pub fn disabled(feed: impl Into<String>) -> Self {
        Self { feed: feed.into(), enabled: false, strict: false, required: Vec::new(), rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: Arc<dyn RecordRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// `Ok` when the record is accepted. In lenient mode violations are
    /// logged and the record is still accepted.
    pub fn validate(&self, record: &TypedRecord) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }

        let missing = missing_fields(&self.required, record);
        if !missing.is_empty() {
            if self.strict {
                return Err(ValidationError::MissingRequired { fields: missing });
            }
            warn!(feed = %self.feed, fields = ?missing, "Record missing required fields");
        }

        for rule in &self.rules {
            if let Err(reason) = rule.check(record) {
                if self.strict {
                    return Err(ValidationError::Rejected { rule: rule.name().to_string(), reason });
                }
                warn!(feed = %self.feed, rule = rule.name(), %reason, "Record breaks validation rule");
            }
        }
        Ok(())
    }
}
