//! Runtime environment detection.
//!
//! Single source of truth for the runtime environment, read from the
//! `AGENT_HUB_ENV` environment variable:
//!
//! - `test` - integration tests (no control-plane, temp config dir)
//! - `development` or `dev` - development mode
//! - anything else or unset - production

/// Runtime environment for the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment.
    Test,
}

impl Environment {
    /// Detect current environment from `AGENT_HUB_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var("AGENT_HUB_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if this is the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Returns `true` if this is the production environment.
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Convenience check for test mode.
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_values() {
        assert_eq!(Environment::parse(Some("test")), Environment::Test);
        assert_eq!(Environment::parse(Some("dev")), Environment::Development);
        assert_eq!(Environment::parse(Some("development")), Environment::Development);
    }

    #[test]
    fn test_unknown_or_unset_is_production() {
        assert_eq!(Environment::parse(None), Environment::Production);
        assert_eq!(Environment::parse(Some("staging")), Environment::Production);
        assert!(Environment::parse(None).is_production());
    }

    #[test]
    fn test_display() {
        assert_eq!(Environment::Test.to_string(), "test");
        assert_eq!(Environment::Production.to_string(), "production");
    }
}
