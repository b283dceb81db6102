//! Error types for the media origin client

use std::fmt;

#[derive(Debug)]
pub enum OriginError {
    Http(Box<reqwest::Error>),
    InvalidTemplate(String),
}

impl fmt::Display for OriginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginError::Http(err) => write!(f, "HTTP error: {}", err),
            OriginError::InvalidTemplate(msg) => write!(f, "Invalid origin URL template: {}", msg),
        }
    }
}

impl std::error::Error for OriginError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OriginError::Http(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OriginError {
    fn from(err: reqwest::Error) -> Self {
        OriginError::Http(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, OriginError>;
