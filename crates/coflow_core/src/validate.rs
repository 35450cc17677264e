//! Field-level validation for proposed mutations.
//!
//! Every command validates its inputs here before touching the document.
//! Failures surface synchronously as [`CoflowError::Validation`] and are
//! never recorded in the undo ledger.

use crate::error::{CoflowError, Result};
use crate::model::{Edge, KafkaConfig, TriggerKind};

/// Maximum job name length.
pub const MAX_NAME_LEN: usize = 100;

fn invalid(field: &str, message: impl Into<String>) -> CoflowError {
    CoflowError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate a job name: 1-100 chars of letters, digits, spaces, hyphens
/// and underscores.
pub fn job_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid("name", "must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(invalid(
            "name",
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, ' ' | '-' | '_')))
    {
        return Err(invalid("name", format!("character '{c}' is not allowed")));
    }
    Ok(())
}

/// Validate an adaptor specifier of the form `@scope/name@version`.
pub fn adaptor(spec: &str) -> Result<()> {
    let parse = || -> Option<()> {
        let rest = spec.strip_prefix('@')?;
        let (scope, rest) = rest.split_once('/')?;
        let (name, version) = rest.rsplit_once('@')?;
        if scope.is_empty() || name.is_empty() || version.is_empty() {
            return None;
        }
        Some(())
    };
    parse().ok_or_else(|| invalid("adaptor", "expected '@scope/name@version'"))
}

/// Validate a standard 5-field cron expression.
///
/// Fields are minute, hour, day-of-month, month, day-of-week. Each field
/// accepts `*`, lists, ranges and `/step` suffixes over its numeric range.
pub fn cron_expression(expr: &str) -> Result<()> {
    const RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(
            "cron_expression",
            format!("expected 5 fields, got {}", fields.len()),
        ));
    }

    for (field, (min, max)) in fields.iter().zip(RANGES) {
        for part in field.split(',') {
            cron_part(part, min, max)
                .map_err(|msg| invalid("cron_expression", format!("'{part}': {msg}")))?;
        }
    }
    Ok(())
}

/// Validate a single list element of a cron field: `*`, `N`, `N-M`,
/// optionally followed by `/step`.
fn cron_part(part: &str, min: u32, max: u32) -> std::result::Result<(), String> {
    if part.is_empty() {
        return Err("empty field element".into());
    }

    let (base, step) = match part.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (part, None),
    };

    if let Some(step) = step {
        let step: u32 = step.parse().map_err(|_| "step is not a number".to_string())?;
        if step == 0 {
            return Err("step must be positive".into());
        }
    }

    if base == "*" {
        return Ok(());
    }

    let parse_bound = |s: &str| -> std::result::Result<u32, String> {
        let n: u32 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
        if n < min || n > max {
            return Err(format!("{n} is outside {min}-{max}"));
        }
        Ok(n)
    };

    match base.split_once('-') {
        Some((lo, hi)) => {
            let lo = parse_bound(lo)?;
            let hi = parse_bound(hi)?;
            if lo > hi {
                return Err(format!("range {lo}-{hi} is inverted"));
            }
        }
        None => {
            parse_bound(base)?;
        }
    }
    Ok(())
}

/// Validate a Kafka trigger configuration.
pub fn kafka_config(config: &KafkaConfig) -> Result<()> {
    if config.hosts.is_empty() {
        return Err(invalid("kafka.hosts", "at least one broker is required"));
    }
    for host in &config.hosts {
        let valid = host
            .rsplit_once(':')
            .is_some_and(|(h, p)| !h.is_empty() && p.parse::<u16>().is_ok());
        if !valid {
            return Err(invalid("kafka.hosts", format!("'{host}' is not host:port")));
        }
    }
    if config.topics.is_empty() {
        return Err(invalid("kafka.topics", "at least one topic is required"));
    }
    if let Some(sasl) = &config.sasl {
        if sasl.username.is_empty() || sasl.password.is_empty() {
            return Err(invalid("kafka.sasl", "username and password are required"));
        }
    }
    Ok(())
}

/// Validate a trigger's discriminated configuration.
pub fn trigger_kind(kind: &TriggerKind) -> Result<()> {
    match kind {
        TriggerKind::Webhook => Ok(()),
        TriggerKind::Cron { expression } => cron_expression(expression),
        TriggerKind::Kafka { configuration } => kafka_config(configuration),
    }
}

/// Validate the credential references of a job: at most one may be set.
pub fn credentials(project: Option<uuid::Uuid>, keychain: Option<uuid::Uuid>) -> Result<()> {
    if project.is_some() && keychain.is_some() {
        return Err(invalid(
            "credential",
            "project and keychain credentials are mutually exclusive",
        ));
    }
    Ok(())
}

/// Validate the shape of a committed edge: exactly one source reference,
/// and an expression when the condition requires one.
pub fn edge_shape(edge: &Edge) -> Result<()> {
    if !edge.has_valid_source() {
        return Err(invalid(
            "edge",
            "exactly one of source_job_id or source_trigger_id must be set",
        ));
    }
    if edge.condition_type == crate::model::EdgeCondition::JsExpression
        && edge
            .condition_expression
            .as_deref()
            .is_none_or(|e| e.trim().is_empty())
    {
        return Err(invalid(
            "condition_expression",
            "required for js_expression conditions",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeCondition, SaslConfig};
    use uuid::Uuid;

    #[test]
    fn test_job_name_accepts_reasonable_names() {
        assert!(job_name("Fetch patients").is_ok());
        assert!(job_name("sync-to-dhis2").is_ok());
        assert!(job_name("step_1").is_ok());
    }

    #[test]
    fn test_job_name_rejects_empty_and_long() {
        assert!(job_name("").is_err());
        assert!(job_name(&"x".repeat(101)).is_err());
        assert!(job_name(&"x".repeat(100)).is_ok());
    }

    #[test]
    fn test_job_name_rejects_disallowed_chars() {
        assert!(job_name("bad/name").is_err());
        assert!(job_name("nope!").is_err());
        assert!(job_name("a\nb").is_err());
    }

    #[test]
    fn test_adaptor_format() {
        assert!(adaptor("@openfn/language-http@6.0.0").is_ok());
        assert!(adaptor("@openfn/language-common@latest").is_ok());
        assert!(adaptor("language-http@6.0.0").is_err());
        assert!(adaptor("@openfn/language-http").is_err());
        assert!(adaptor("@/x@1").is_err());
        assert!(adaptor("").is_err());
    }

    #[test]
    fn test_cron_valid_expressions() {
        assert!(cron_expression("* * * * *").is_ok());
        assert!(cron_expression("0 * * * *").is_ok());
        assert!(cron_expression("*/5 0-12 1,15 * 1-5").is_ok());
        assert!(cron_expression("59 23 31 12 6").is_ok());
    }

    #[test]
    fn test_cron_invalid_expressions() {
        assert!(cron_expression("").is_err());
        assert!(cron_expression("* * * *").is_err());
        assert!(cron_expression("60 * * * *").is_err());
        assert!(cron_expression("* 24 * * *").is_err());
        assert!(cron_expression("* * 0 * *").is_err());
        assert!(cron_expression("5-1 * * * *").is_err());
        assert!(cron_expression("*/0 * * * *").is_err());
        assert!(cron_expression("a * * * *").is_err());
    }

    #[test]
    fn test_kafka_config() {
        let mut config = KafkaConfig {
            hosts: vec!["broker:9092".into()],
            topics: vec!["events".into()],
            initial_offset_reset_policy: "earliest".into(),
            sasl: None,
        };
        assert!(kafka_config(&config).is_ok());

        config.hosts = vec!["no-port".into()];
        assert!(kafka_config(&config).is_err());

        config.hosts = vec!["broker:9092".into()];
        config.topics.clear();
        assert!(kafka_config(&config).is_err());

        config.topics = vec!["events".into()];
        config.sasl = Some(SaslConfig {
            mechanism: "plain".into(),
            username: "u".into(),
            password: String::new(),
        });
        assert!(kafka_config(&config).is_err());
    }

    #[test]
    fn test_credentials_xor() {
        assert!(credentials(None, None).is_ok());
        assert!(credentials(Some(Uuid::new_v4()), None).is_ok());
        assert!(credentials(None, Some(Uuid::new_v4())).is_ok());
        assert!(credentials(Some(Uuid::new_v4()), Some(Uuid::new_v4())).is_err());
    }

    #[test]
    fn test_edge_shape_requires_expression_for_js() {
        let mut edge =
            Edge::from_job(Uuid::new_v4(), Uuid::new_v4(), EdgeCondition::JsExpression);
        assert!(edge_shape(&edge).is_err());

        edge.condition_expression = Some("state.ok".into());
        assert!(edge_shape(&edge).is_ok());
    }
}
