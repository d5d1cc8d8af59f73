//! Error types for the rustyblue-sec library
//!
//! This module defines the error types returned directly to callers. Asynchronous
//! outcomes of security procedures are reported with [`crate::security::SecStatus`].

use thiserror::Error;

/// Errors that can occur when decoding HCI packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Unexpected HCI event code: 0x{0:02x}")]
    UnexpectedEvent(u8),
}

/// Result type for HCI decoding
pub type HciResult<T> = Result<T, HciError>;

/// Errors returned synchronously by the security manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecError {
    #[error("No free service security records")]
    NoServiceRecords,

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("HCI error: {0}")]
    Hci(#[from] HciError),
}

/// Result type for security manager operations
pub type SecResult<T> = Result<T, SecError>;
