//! DevNonce / JoinNonce ordering
//!
//! A DevNonce is accepted only if it is strictly greater than the last one
//! accepted for the device. Neither counter ever wraps: once a device has
//! used the top of either space it can no longer join.

use crate::error::JoinError;
use crate::registry::JoinNonceState;
use crate::lorawan::MacVersion;

/// Largest JoinNonce (24-bit)
pub const JOIN_NONCE_MAX: u32 = 0x00FF_FFFF;

/// Nonces of a join that passed the freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub dev_nonce: u16,
    pub join_nonce: u32,
}

pub fn check(
    state: &JoinNonceState,
    dev_nonce: u16,
    version: MacVersion,
) -> Result<Freshness, JoinError> {
    let max = version.scheme().dev_nonce_max();
    if dev_nonce > max {
        return Err(JoinError::DevNonceOutOfRange {
            received: dev_nonce,
            max,
        });
    }

    if let Some(last) = state.last_dev_nonce {
        if last >= max {
            return Err(JoinError::DevNonceExhausted);
        }
        if dev_nonce <= last {
            return Err(JoinError::StaleDevNonce {
                received: dev_nonce,
                last,
            });
        }
    }

    if state.last_join_nonce >= JOIN_NONCE_MAX {
        return Err(JoinError::JoinNonceExhausted);
    }

    Ok(Freshness {
        dev_nonce,
        join_nonce: state.last_join_nonce + 1,
    })
}
