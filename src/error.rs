use std::{fmt, io, path::StripPrefixError};

use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum PromptError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid processing instruction: {0}")]
    Instruction(String),
    #[error("Invalid weights: {0}")]
    InvalidWeights(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Markup error: {0}")]
    Markup(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("Random count checkpoint {requested} is behind the current draw count {current}")]
    RandomCount { requested: u64, current: u64 },
    #[error("Invalid selector: {0}")]
    Selector(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Unknown prompt file type: {0}")]
    UnknownFormat(String),
    #[error("Unknown processing instruction: {0}")]
    UnknownInstruction(String),
}

impl From<StripPrefixError> for PromptError {
    fn from(src: StripPrefixError) -> PromptError {
        PromptError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for PromptError {
    fn from(src: toml::de::Error) -> PromptError {
        PromptError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for PromptError {
    fn from(src: toml::ser::Error) -> PromptError {
        PromptError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<serde_yaml::Error> for PromptError {
    fn from(src: serde_yaml::Error) -> PromptError {
        PromptError::Serialization(format!("Yaml deserialization error: {src}"))
    }
}

impl From<JsonError> for PromptError {
    fn from(src: JsonError) -> PromptError {
        PromptError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for PromptError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => PromptError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => PromptError::PermissionDenied,
            _ => PromptError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<walkdir::Error> for PromptError {
    fn from(x: walkdir::Error) -> Self {
        match x.into_io_error() {
            Some(io_error) => io_error.into(),
            None => PromptError::Io("directory walk hit a filesystem loop".to_string()),
        }
    }
}

impl From<fmt::Error> for PromptError {
    fn from(x: fmt::Error) -> Self {
        PromptError::Serialization(format!("{x}"))
    }
}

impl From<RegexError> for PromptError {
    fn from(x: RegexError) -> Self {
        PromptError::Serialization(format!("Regex parse failed: {x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: PromptError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, PromptError::NotFound(_)));

        let err: PromptError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(err, PromptError::PermissionDenied);
    }

    #[test]
    fn test_random_count_message() {
        let err = PromptError::RandomCount {
            requested: 3,
            current: 5,
        };
        assert_eq!(
            err.to_string(),
            "Random count checkpoint 3 is behind the current draw count 5"
        );
    }
}
