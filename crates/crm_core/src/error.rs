use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrmError>;

#[derive(Error, Debug)]
pub enum CrmError {
    /// A required setting (URL or key) is absent from env, `.env` and config.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// The config file exists but could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The hosted database could not be reached.
    #[error("database unreachable: {0}")]
    Connection(String),

    /// User input was rejected before anything was sent.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The database answered but refused or failed the request.
    #[error("database request failed: {0}")]
    Persistence(String),

    #[error("contact not found: {0}")]
    NotFound(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The SQL batch was rejected; carries the remote message verbatim.
    #[error("{0}")]
    RemoteExecution(String),

    /// The local record of applied migration scripts failed.
    #[error("migration ledger: {0}")]
    Ledger(String),
}

impl CrmError {
    /// True for failures that mean the database is not usable at all, as
    /// opposed to a single request going wrong.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ConfigurationMissing(_) | Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::CrmError;

    #[test]
    fn unavailable_covers_config_and_connection_only() {
        assert!(CrmError::ConfigurationMissing("SUPABASE_URL".to_string()).is_unavailable());
        assert!(CrmError::Connection("refused".to_string()).is_unavailable());
        assert!(!CrmError::NotFound("c-1".to_string()).is_unavailable());
        assert!(!CrmError::Validation("empty".to_string()).is_unavailable());
    }

    #[test]
    fn remote_execution_message_is_verbatim() {
        let error = CrmError::RemoteExecution("relation \"x\" already exists".to_string());
        assert_eq!(error.to_string(), "relation \"x\" already exists");
    }

    #[test]
    fn file_not_found_names_the_path() {
        let error = CrmError::FileNotFound("database/missing.sql".into());
        assert_eq!(error.to_string(), "file not found: database/missing.sql");
    }
}
