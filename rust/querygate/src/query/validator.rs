//! Lexical allow/deny gate for free-form SQL.
//!
//! This is not a parser. The checks run on the trimmed, upper-cased text: the statement
//! must start with an allowed verb and must not contain any mutating keyword anywhere,
//! including inside string literals and identifiers (`UPDATED_AT` is rejected). Comment
//! tricks and Unicode look-alike characters are not detected.

use crate::config::QuerySettings;
use thiserror::Error;

pub const FORBIDDEN_KEYWORDS: [&str; 9] = [
    "DROP", "DELETE", "TRUNCATE", "INSERT", "UPDATE", "ALTER", "CREATE", "EXEC", "EXECUTE",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("query cannot be empty")]
    EmptyQuery,

    #[error("query must start with one of: {}", allowed.join(", "))]
    DisallowedCommand { allowed: Vec<String> },

    #[error("query contains forbidden keyword: {0}")]
    ForbiddenKeyword(&'static str),
}

#[derive(Debug, Clone)]
pub struct QueryValidator {
    enabled: bool,
    allowed_commands: Vec<String>,
}

impl QueryValidator {
    pub fn new(enabled: bool, allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|cmd| cmd.trim().to_uppercase())
            .filter(|cmd| !cmd.is_empty())
            .collect();
        Self {
            enabled,
            allowed_commands,
        }
    }

    pub fn from_settings(settings: &QuerySettings) -> Self {
        Self::new(settings.enable_validation, settings.allowed_commands.clone())
    }

    pub fn validate(&self, sql: &str) -> Result<(), ValidationError> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyQuery);
        }

        if !self.enabled {
            return Ok(());
        }

        let normalized = trimmed.to_uppercase();
        if !self
            .allowed_commands
            .iter()
            .any(|cmd| normalized.starts_with(cmd.as_str()))
        {
            return Err(ValidationError::DisallowedCommand {
                allowed: self.allowed_commands.clone(),
            });
        }

        if let Some(keyword) = FORBIDDEN_KEYWORDS
            .into_iter()
            .find(|keyword| normalized.contains(*keyword))
        {
            return Err(ValidationError::ForbiddenKeyword(keyword));
        }

        Ok(())
    }
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new(true, vec!["SELECT".to_string()])
    }
}
