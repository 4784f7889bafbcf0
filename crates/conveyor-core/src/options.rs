use crate::error::{Error, Result};
use std::time::Duration;

/// Per-database store configuration.
///
/// Immutable after construction (clone-and-edit before handing it to a
/// store). Schema and table names are interpolated into SQL as quoted
/// identifiers, so `validate` restricts them to `[A-Za-z0-9_]`.
///
/// This struct doubles as the read-only capability bundle the cleanup
/// service consumes: connection string, schema, and table are public fields
/// rather than something to be recovered from a store's internals.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    pub connection_string: String,
    pub schema_name: String,
    pub table_name: String,
    pub enable_schema_deployment: bool,
    pub retention_period: Duration,
    pub enable_automatic_cleanup: bool,
    pub cleanup_interval: Duration,
    pub lease_duration: Duration,
}

impl StoreOptions {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema_name: "infra".to_string(),
            table_name: "outbox".to_string(),
            enable_schema_deployment: true,
            retention_period: Duration::from_secs(7 * 24 * 60 * 60),
            enable_automatic_cleanup: true,
            cleanup_interval: Duration::from_secs(60 * 60),
            lease_duration: Duration::from_secs(5 * 60),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(Error::config("connection string is required"));
        }
        validate_identifier("schema name", &self.schema_name)?;
        validate_identifier("table name", &self.table_name)?;
        if self.retention_period.is_zero() {
            return Err(Error::config("retention period must be greater than zero"));
        }
        if self.enable_automatic_cleanup && self.cleanup_interval.is_zero() {
            return Err(Error::config("cleanup interval must be greater than zero"));
        }
        if self.lease_duration.is_zero() {
            return Err(Error::config("lease duration must be greater than zero"));
        }
        Ok(())
    }
}

fn validate_identifier(label: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::config(format!("{label} is required")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::config(format!(
            "{label} '{value}' must contain only ASCII alphanumerics and underscores"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StoreOptions::new("postgres://localhost/app").validate().unwrap();
    }

    #[test]
    fn empty_connection_string_is_rejected() {
        let opts = StoreOptions::new("  ");
        assert!(matches!(opts.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn hostile_schema_name_is_rejected() {
        let mut opts = StoreOptions::new("postgres://localhost/app");
        opts.schema_name = "infra\"; DROP TABLE outbox; --".to_string();
        assert!(matches!(opts.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let mut opts = StoreOptions::new("postgres://localhost/app");
        opts.retention_period = Duration::ZERO;
        assert!(opts.validate().is_err());

        let mut opts = StoreOptions::new("postgres://localhost/app");
        opts.lease_duration = Duration::ZERO;
        assert!(opts.validate().is_err());

        let mut opts = StoreOptions::new("postgres://localhost/app");
        opts.cleanup_interval = Duration::ZERO;
        assert!(opts.validate().is_err());

        // Cleanup interval only matters when automatic cleanup is on.
        let mut opts = StoreOptions::new("postgres://localhost/app");
        opts.cleanup_interval = Duration::ZERO;
        opts.enable_automatic_cleanup = false;
        assert!(opts.validate().is_ok());
    }
}
