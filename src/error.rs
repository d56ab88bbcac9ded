//! Error types for the join server.
//!
//! Every failure on the request path ends up as a [`JoinError`], which
//! knows the Backend Interfaces result code it is reported with and the
//! class it is logged under.

use thiserror::Error;

use crate::interop::handler::JoinState;
use crate::interop::messages::ResultCode;
use crate::lorawan::{Eui64, MacVersion, NetId};
use crate::registry::DeviceIdentity;

/// Failures of the primitive crypto helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key wrap input must be a multiple of 8 bytes and at least 16.
    #[error("invalid key wrap input length: {0} bytes")]
    InvalidWrapInput(usize),

    /// Wrapped key length is not a multiple of 8 or too short.
    #[error("invalid wrapped key length: {0} bytes")]
    InvalidWrappedLength(usize),

    /// The integrity check value did not match after unwrapping.
    #[error("key unwrap integrity check failed")]
    UnwrapIntegrity,

    /// Key material of the wrong length.
    #[error("invalid AES-128 key length: {0} bytes")]
    InvalidKeyLength(usize),
}

/// Failures decoding or encoding wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Envelope is not valid JSON or is missing fields.
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// A hex field could not be decoded.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// A field has the wrong number of bytes.
    #[error("{field} must be {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// PHYPayload carries a different frame type.
    #[error("unexpected MType in PHYPayload: {0}")]
    UnexpectedMType(String),

    /// Envelope MessageType is not the one expected here.
    #[error("unexpected MessageType {actual}, expected {expected}")]
    UnexpectedMessageType {
        expected: &'static str,
        actual: String,
    },

    /// PHYPayload major version is not LoRaWAN R1.
    #[error("unsupported LoRaWAN major version: {0}")]
    UnsupportedMajor(u8),
}

/// Failures reported by the key registry or agreement store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device not provisioned")]
    DeviceUnknown,

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// Stored nonce state changed since it was read.
    #[error("nonce state changed since lookup")]
    Conflict,
}

/// Coarse grouping of rejections, used to pick the log level and to let
/// operators alert on internal failures separately from policy rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Format,
    Policy,
    Freshness,
    Conflict,
    Cancelled,
    Internal,
}

/// Why a join request was rejected.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unsupported protocol version {0:?}")]
    InvalidProtocolVersion(String),

    #[error("unsupported MAC version {0:?}")]
    UnsupportedVersion(String),

    #[error("join request MIC mismatch")]
    IntegrityCheckFailed,

    #[error("DevNonce {received} outside the nonce space (max {max})")]
    DevNonceOutOfRange { received: u16, max: u16 },

    #[error("unknown sender {0}")]
    UnknownSender(NetId),

    #[error("sender {claimed} does not match authenticated peer {authenticated:?}")]
    SenderMismatch {
        claimed: NetId,
        authenticated: Option<NetId>,
    },

    #[error("join server does not serve JoinEUI {0}")]
    UnknownReceiver(Eui64),

    #[error("no roaming agreement between {net_id} and JoinEUI {join_eui}")]
    NoRoamingAgreement { join_eui: Eui64, net_id: NetId },

    #[error("unknown device {0}")]
    DeviceUnknown(DeviceIdentity),

    #[error("device {0} is deactivated")]
    Deactivated(DeviceIdentity),

    #[error("device provisioned for LoRaWAN {provisioned}, request uses {requested}")]
    MacVersionMismatch {
        provisioned: MacVersion,
        requested: MacVersion,
    },

    #[error("stale DevNonce {received} (last accepted {last})")]
    StaleDevNonce { received: u16, last: u16 },

    #[error("DevNonce space exhausted")]
    DevNonceExhausted,

    #[error("JoinNonce space exhausted")]
    JoinNonceExhausted,

    #[error("superseded by a concurrent join for the same device")]
    Superseded,

    #[error("request cancelled before it was answered")]
    Cancelled,

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("root key {0} not provisioned")]
    MissingRootKey(&'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: JoinState, to: JoinState },
}

impl JoinError {
    /// Result code reported to the requesting network server.
    pub fn result_code(&self) -> ResultCode {
        match self {
            JoinError::Malformed(_)
            | JoinError::Codec(_)
            | JoinError::IntegrityCheckFailed
            | JoinError::DevNonceOutOfRange { .. } => ResultCode::MalformedMessage,
            JoinError::InvalidProtocolVersion(_) => ResultCode::InvalidProtocolVersion,
            JoinError::UnsupportedVersion(_) | JoinError::MacVersionMismatch { .. } => {
                ResultCode::UnsupportedVersion
            }
            JoinError::UnknownSender(_) | JoinError::SenderMismatch { .. } => {
                ResultCode::UnknownSender
            }
            JoinError::UnknownReceiver(_) => ResultCode::UnknownReceiver,
            JoinError::NoRoamingAgreement { .. } => ResultCode::NoRoamingAgreement,
            JoinError::DeviceUnknown(_) => ResultCode::UnknownDevEui,
            JoinError::Deactivated(_) | JoinError::JoinNonceExhausted => {
                ResultCode::DeactivatedEndDevice
            }
            JoinError::StaleDevNonce { .. } | JoinError::DevNonceExhausted => {
                ResultCode::StaleDevNonce
            }
            JoinError::Superseded => ResultCode::Superseded,
            JoinError::Cancelled => ResultCode::Cancelled,
            JoinError::RegistryUnavailable(_)
            | JoinError::MissingRootKey(_)
            | JoinError::Crypto(_)
            | JoinError::InvalidTransition { .. } => ResultCode::InternalError,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            JoinError::Malformed(_)
            | JoinError::Codec(_)
            | JoinError::InvalidProtocolVersion(_)
            | JoinError::UnsupportedVersion(_)
            | JoinError::IntegrityCheckFailed
            | JoinError::DevNonceOutOfRange { .. } => ErrorClass::Format,
            JoinError::UnknownSender(_)
            | JoinError::SenderMismatch { .. }
            | JoinError::UnknownReceiver(_)
            | JoinError::NoRoamingAgreement { .. }
            | JoinError::DeviceUnknown(_)
            | JoinError::Deactivated(_)
            | JoinError::MacVersionMismatch { .. } => ErrorClass::Policy,
            JoinError::StaleDevNonce { .. }
            | JoinError::DevNonceExhausted
            | JoinError::JoinNonceExhausted => ErrorClass::Freshness,
            JoinError::Superseded => ErrorClass::Conflict,
            JoinError::Cancelled => ErrorClass::Cancelled,
            JoinError::RegistryUnavailable(_)
            | JoinError::MissingRootKey(_)
            | JoinError::Crypto(_)
            | JoinError::InvalidTransition { .. } => ErrorClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_failure_reported_as_malformed() {
        let err = JoinError::IntegrityCheckFailed;
        assert_eq!(err.result_code(), ResultCode::MalformedMessage);
        assert_eq!(err.class(), ErrorClass::Format);
    }

    #[test]
    fn test_internal_errors_distinct_from_policy() {
        let unavailable = JoinError::RegistryUnavailable("timeout".into());
        let unknown = JoinError::DeviceUnknown(DeviceIdentity::new(
            Eui64::from_u64(1),
            Eui64::from_u64(2),
        ));

        assert_eq!(unavailable.result_code(), ResultCode::InternalError);
        assert_eq!(unavailable.class(), ErrorClass::Internal);
        assert_eq!(unknown.result_code(), ResultCode::UnknownDevEui);
        assert_eq!(unknown.class(), ErrorClass::Policy);
    }

    #[test]
    fn test_nonce_exhaustion_codes() {
        assert_eq!(
            JoinError::DevNonceExhausted.result_code(),
            ResultCode::StaleDevNonce
        );
        assert_eq!(
            JoinError::JoinNonceExhausted.result_code(),
            ResultCode::DeactivatedEndDevice
        );
    }
}
