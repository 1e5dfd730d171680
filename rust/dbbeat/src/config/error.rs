//! Startup configuration failures.
//!
//! Every variant carries a hint naming the setting or command that fixes it.

/// Why dbbeat refused to start with the given configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigurationError {
    /// A setting is present but unusable.
    #[error("{problem}\n  hint: {hint}")]
    BadValue { problem: String, hint: String },

    /// A setting dbbeat cannot run without is absent.
    #[error("`{key}` is not set (needed for {needed_for})\n  hint: set {set_via}")]
    Unset {
        key: String,
        needed_for: String,
        set_via: String,
    },

    /// A backing service did not answer at startup.
    #[error("cannot reach {service} at {endpoint}: {cause}\n  hint: {hint}")]
    Unreachable {
        service: String,
        endpoint: String,
        cause: String,
        hint: String,
    },

    /// Every problem found in one validation pass.
    #[error("{} configuration problems:{}", .0.len(), numbered(.0))]
    Several(Vec<ConfigurationError>),
}

fn numbered(errors: &[ConfigurationError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, err)| format!("\n[{}] {err}", i + 1))
        .collect()
}

impl ConfigurationError {
    #[must_use]
    pub fn bad_value(problem: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::BadValue {
            problem: problem.into(),
            hint: hint.into(),
        }
    }

    #[must_use]
    pub fn unset(
        key: impl Into<String>,
        needed_for: impl Into<String>,
        set_via: impl Into<String>,
    ) -> Self {
        Self::Unset {
            key: key.into(),
            needed_for: needed_for.into(),
            set_via: set_via.into(),
        }
    }

    #[must_use]
    pub fn unreachable(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        cause: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self::Unreachable {
            service: service.into(),
            endpoint: endpoint.into(),
            cause: cause.into(),
            hint: hint.into(),
        }
    }

    /// `None` for no problems, the lone error for one, `Several` otherwise.
    #[must_use]
    pub fn from_errors(mut errors: Vec<ConfigurationError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Several(errors)),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Several(errors) => errors.len(),
            _ => 1,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_value_shows_hint() {
        let err = ConfigurationError::bad_value(
            "scheduler.timezone 'Mars/Olympus' is not a known timezone",
            "use an IANA name such as Asia/Shanghai",
        );
        assert_eq!(
            err.to_string(),
            "scheduler.timezone 'Mars/Olympus' is not a known timezone\n  \
             hint: use an IANA name such as Asia/Shanghai"
        );
    }

    #[test]
    fn test_unreachable_names_endpoint_and_cause() {
        let err = ConfigurationError::unreachable(
            "Redis",
            "redis://localhost:6379",
            "connection refused",
            "is redis-server running?",
        );
        let msg = err.to_string();
        assert!(msg.starts_with("cannot reach Redis at redis://localhost:6379"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_from_errors_collapses() {
        assert!(ConfigurationError::from_errors(Vec::new()).is_none());

        let single =
            ConfigurationError::from_errors(vec![ConfigurationError::bad_value("a", "b")])
                .unwrap();
        assert!(matches!(single, ConfigurationError::BadValue { .. }));

        let several = ConfigurationError::from_errors(vec![
            ConfigurationError::bad_value("a", "b"),
            ConfigurationError::unset("database.path", "schedule storage", "DBBEAT__DATABASE__PATH"),
        ])
        .unwrap();
        assert_eq!(several.count(), 2);
        let msg = several.to_string();
        assert!(msg.starts_with("2 configuration problems:"));
        assert!(msg.contains("[1] a"));
        assert!(msg.contains("[2] `database.path` is not set"));
    }
}
