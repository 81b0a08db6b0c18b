use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutolinkErrorKind {
    ConfigConflict,
    InvalidConfig,
    AttachMismatch,
    ProtocolViolation,
    UnknownConnection,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AutolinkError {
    pub kind: AutolinkErrorKind,
    pub message: String,
}

impl AutolinkError {
    pub fn new(kind: AutolinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub fn config_conflict(message: impl Into<String>) -> AutolinkError {
    AutolinkError::new(AutolinkErrorKind::ConfigConflict, message)
}

pub fn invalid_config(message: impl Into<String>) -> AutolinkError {
    AutolinkError::new(AutolinkErrorKind::InvalidConfig, message)
}

pub fn attach_mismatch(message: impl Into<String>) -> AutolinkError {
    AutolinkError::new(AutolinkErrorKind::AttachMismatch, message)
}

pub fn protocol_violation(message: impl Into<String>) -> AutolinkError {
    AutolinkError::new(AutolinkErrorKind::ProtocolViolation, message)
}

pub fn unknown_connection(message: impl Into<String>) -> AutolinkError {
    AutolinkError::new(AutolinkErrorKind::UnknownConnection, message)
}
