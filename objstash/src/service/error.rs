//! The stable error taxonomy surfaced in service replies.
//!
//! Codes never change between releases; clients match on them while
//! the accompanying text is free-form.

use crate::cache::types::CacheError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidParams,
    Exists,
    Define,
    Change,
    Delete,
    Resize,
    InUse,
    Perm,
    Argument,
    Directory,
    Copy,
    Configuration,
}

impl ErrorCode {
    /// The wire representation of this error kind.
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::InvalidParams => 1,
            ErrorCode::Exists => 2,
            ErrorCode::Define => 3,
            ErrorCode::Change => 4,
            ErrorCode::Delete => 5,
            ErrorCode::Resize => 6,
            ErrorCode::InUse => 7,
            ErrorCode::Perm => 8,
            ErrorCode::Argument => 9,
            ErrorCode::Directory => 10,
            ErrorCode::Copy => 11,
            ErrorCode::Configuration => 12,
        }
    }
}

/// One error reply: a stable code plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    pub code: ErrorCode,
    pub text: String,
}

impl ReplyError {
    pub fn new(code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn invalid_params(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, text)
    }

    pub fn exists(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::Exists, text)
    }

    /// Map an engine failure onto the given fallback code, keeping the
    /// engine's reason text.
    pub fn from_engine(code: ErrorCode, error: &CacheError) -> Self {
        Self::new(code, error.to_string())
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.text, self.code.code())
    }
}

impl std::error::Error for ReplyError {}
