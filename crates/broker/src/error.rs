// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Closed error taxonomy shared across every broker boundary (PTY I/O, the
//! delivery planner, bus ingestion, and the HTTP/WebSocket transport).
//!
//! Every fallible operation maps its failure into one of these kinds rather
//! than leaking a library error, so the transport layer can translate a
//! single `BrokerError` into both an HTTP status and a lifecycle event.

use std::fmt;

/// Unified error kind shared across the broker core and transport surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidTarget,
    NoRoute,
    NameConflict,
    SpawnFailed,
    UnsupportedCli,
    WriteFailed,
    Timeout,
    Duplicate,
    Malformed,
    RateLimited,
    UnknownAgent,
    Shutdown,
    Fatal,
    Internal,
    Unauthorized,
}

impl ErrorKind {
    /// HTTP status code this kind maps to on the transport surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidTarget | Self::Malformed => 400,
            Self::NoRoute | Self::NameConflict | Self::UnknownAgent => 409,
            Self::SpawnFailed | Self::UnsupportedCli => 422,
            Self::WriteFailed | Self::Internal => 500,
            Self::Timeout => 504,
            Self::Duplicate => 202,
            Self::RateLimited => 503,
            Self::Shutdown => 503,
            Self::Fatal => 500,
            Self::Unauthorized => 401,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTarget => "INVALID_TARGET",
            Self::NoRoute => "NO_ROUTE",
            Self::NameConflict => "NAME_CONFLICT",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::UnsupportedCli => "UNSUPPORTED_CLI",
            Self::WriteFailed => "WRITE_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Duplicate => "DUPLICATE",
            Self::Malformed => "MALFORMED",
            Self::RateLimited => "RATE_LIMITED",
            Self::UnknownAgent => "UNKNOWN_AGENT",
            Self::Shutdown => "SHUTDOWN",
            Self::Fatal => "FATAL",
            Self::Internal => "INTERNAL",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broker error: a closed `ErrorKind` plus a human-readable detail.
#[derive(Debug, Clone)]
pub struct BrokerError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl BrokerError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn invalid_target(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTarget, detail)
    }

    pub fn no_route(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoRoute, detail)
    }

    pub fn name_conflict(name: &str) -> Self {
        Self::new(ErrorKind::NameConflict, format!("agent '{name}' already live"))
    }

    pub fn unknown_agent(name: &str) -> Self {
        Self::new(ErrorKind::UnknownAgent, format!("no such agent '{name}'"))
    }

    pub fn spawn_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::SpawnFailed, detail)
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "broker is shutting down")
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized, "missing or invalid bearer token")
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for BrokerError {}
