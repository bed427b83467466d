use serde::Serialize;
use tracing::{debug, info};

use crate::model::{HostLimits, ImportConfiguration, SourceKind, SourceReadiness};
use crate::source::{RemoteFetcher, SourceReader};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub check: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceKind>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub issues: Vec<ValidationIssue>,
    pub source_readiness: SourceReadiness,
}

impl ValidationReport {
    /// Errors that prevent a run from `kind`. Problems with the other source
    /// do not block it, but an unconfigured selected source does.
    pub fn blocking_for(&self, kind: SourceKind) -> Vec<String> {
        let mut errors = self
            .issues
            .iter()
            .filter(|issue| issue.check != "source")
            .filter(|issue| issue.source.is_none_or(|source| source == kind))
            .map(|issue| issue.message.clone())
            .collect::<Vec<_>>();

        let selected_reported = self
            .issues
            .iter()
            .any(|issue| issue.source == Some(kind));
        if !self.source_readiness.is_ready(kind) && !selected_reported {
            errors.insert(0, format!("no {kind} source location configured"));
        }
        errors
    }
}

/// Checks an import configuration against the host environment. Every check
/// runs regardless of earlier failures; the only side effect is a short
/// reachability probe per configured source.
pub struct ConfigValidator<'a> {
    fetcher: &'a dyn RemoteFetcher,
    limits: HostLimits,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(fetcher: &'a dyn RemoteFetcher, limits: HostLimits) -> Self {
        Self { fetcher, limits }
    }

    pub fn validate(&self, config: &ImportConfiguration) -> ValidationReport {
        let reader = SourceReader::new(self.fetcher, config);
        let mut issues = Vec::new();
        let mut readiness = SourceReadiness::default();

        let remote = config.location(SourceKind::Remote);
        let local = config.location(SourceKind::Local);
        if remote.is_empty() && local.is_empty() {
            issues.push(issue("source", None, "no import source configured".to_string()));
        }

        for (kind, location) in [(SourceKind::Remote, remote), (SourceKind::Local, local)] {
            if location.is_empty() {
                continue;
            }
            match reader.probe(kind, location) {
                Ok(()) => match kind {
                    SourceKind::Remote => readiness.remote_ready = true,
                    SourceKind::Local => readiness.local_ready = true,
                },
                Err(err) => {
                    debug!(source = %kind, kind = err.kind(), "source probe failed");
                    issues.push(issue(
                        match kind {
                            SourceKind::Remote => "remote_source",
                            SourceKind::Local => "local_source",
                        },
                        Some(kind),
                        format!("{kind} source: {err}"),
                    ));
                }
            }
        }

        if config.record_kind.trim().is_empty() {
            issues.push(issue(
                "record_kind",
                None,
                "destination record kind must not be empty".to_string(),
            ));
        }

        if config.required_fields.is_empty() {
            issues.push(issue(
                "required_fields",
                None,
                "at least one required field must be configured".to_string(),
            ));
        }

        if config.known_fields.is_empty() {
            issues.push(issue(
                "known_fields",
                None,
                "the destination field whitelist must not be empty".to_string(),
            ));
        } else {
            let outside = config
                .required_fields
                .iter()
                .filter(|field| !config.known_fields.contains(field))
                .cloned()
                .collect::<Vec<_>>();
            if !outside.is_empty() {
                issues.push(issue(
                    "required_fields",
                    None,
                    format!(
                        "required fields missing from the whitelist: {}",
                        outside.join(", ")
                    ),
                ));
            }

            if config.skip_duplicates && !config.known_fields.contains(&config.key_field) {
                issues.push(issue(
                    "key_field",
                    None,
                    format!(
                        "duplicate key field {:?} is not a whitelisted field",
                        config.key_field
                    ),
                ));
            }
        }

        if config.max_memory_mb == 0 || config.max_memory_mb > self.limits.max_memory_mb {
            issues.push(issue(
                "memory_limit",
                None,
                format!(
                    "memory limit {} MB must be between 1 and the host ceiling of {} MB",
                    config.max_memory_mb, self.limits.max_memory_mb
                ),
            ));
        }

        if config.max_execution_secs == 0
            || config.max_execution_secs > self.limits.max_execution_secs
        {
            issues.push(issue(
                "time_limit",
                None,
                format!(
                    "execution limit {} s must be between 1 and the host ceiling of {} s",
                    config.max_execution_secs, self.limits.max_execution_secs
                ),
            ));
        }

        if !config.delimiter.is_ascii() || matches!(config.delimiter, '"' | '\n' | '\r') {
            issues.push(issue(
                "delimiter",
                None,
                format!("unsupported field delimiter {:?}", config.delimiter),
            ));
        }

        let report = ValidationReport {
            valid: issues.is_empty(),
            errors: issues.iter().map(|issue| issue.message.clone()).collect(),
            issues,
            source_readiness: readiness,
        };
        info!(
            valid = report.valid,
            errors = report.errors.len(),
            remote_ready = readiness.remote_ready,
            local_ready = readiness.local_ready,
            "validated import configuration"
        );
        report
    }
}

fn issue(check: &'static str, source: Option<SourceKind>, message: String) -> ValidationIssue {
    ValidationIssue {
        check,
        source,
        message,
    }
}
