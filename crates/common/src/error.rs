// Error types for WG Tunnel Manager

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("Invalid configuration format: {0}")]
    InvalidConfigFormat(String),

    #[error("Invalid tunnel name: {0:?}")]
    InvalidName(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("No mechanism available to {action} tunnel {name}: {diagnostics}")]
    MechanismNotFound {
        name: String,
        action: String,
        diagnostics: String,
    },

    #[error("Failed to {action} tunnel {name}: {diagnostics}")]
    ExternalProcess {
        name: String,
        action: String,
        diagnostics: String,
    },

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Tunnel {0} is busy with another operation")]
    Busy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Stable machine-readable code, carried in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConfigNotFound(_) => "ConfigNotFound",
            Error::InvalidConfigFormat(_) => "InvalidConfigFormat",
            Error::InvalidName(_) => "InvalidName",
            Error::Encryption(_) => "EncryptionFailure",
            Error::MechanismNotFound { .. } => "MechanismNotFound",
            Error::ExternalProcess { .. } => "ExternalProcessFailure",
            Error::FileSystem(_) | Error::Io(_) => "FileSystemError",
            Error::Busy(_) => "Busy",
            Error::Config(_) | Error::Serialization(_) | Error::Toml(_) => "ConfigError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::Busy("wg0".into()).code(), "Busy");
        assert_eq!(Error::ConfigNotFound("wg0".into()).code(), "ConfigNotFound");
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(Error::from(io).code(), "FileSystemError");
        let err = Error::ExternalProcess {
            name: "wg0".into(),
            action: "activate".into(),
            diagnostics: "primary executable: exit 1".into(),
        };
        assert_eq!(err.code(), "ExternalProcessFailure");
        assert_eq!(
            err.to_string(),
            "Failed to activate tunnel wg0: primary executable: exit 1"
        );
    }
}
