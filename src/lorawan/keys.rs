//! LoRaWAN root keys, session keys and session key derivation
//!
//! Two derivation schemes, selected by MAC version:
//! - 1.0.x: NwkSKey and AppSKey from the single root key, JoinNonce and NetID
//! - 1.1: FNwkSIntKey, SNwkSIntKey, NwkSEncKey from NwkKey and AppSKey
//!   from AppKey, each with its own domain separator byte

use std::fmt;
use std::str::FromStr;

use super::crypto::{aes128_encrypt, BLOCK_SIZE};
use super::{decode_hex_array, string_serde, Eui64, KeyScheme, MacVersion, NetId};
use crate::error::{CodecError, CryptoError, JoinError};

/// 128-bit AES key. Debug output never shows the key bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AesKey([u8; 16]);

impl AesKey {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

impl fmt::Display for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl FromStr for AesKey {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex_array::<16>("AES key", s).map(Self)
    }
}

string_serde!(AesKey);

/// Device root keys, as provisioned in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootKeySet {
    pub nwk_key: AesKey,
    pub app_key: Option<AesKey>,
}

impl RootKeySet {
    /// Key that signs the Join-Request and the Join-Accept.
    ///
    /// 1.0.x devices hold a single root key; it is stored as AppKey when
    /// provisioned, otherwise as NwkKey.
    pub fn root_key(&self, scheme: KeyScheme) -> &AesKey {
        match scheme {
            KeyScheme::Legacy => self.app_key.as_ref().unwrap_or(&self.nwk_key),
            KeyScheme::Current => &self.nwk_key,
        }
    }
}

/// Per-join inputs to key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivationInput {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub join_nonce: u32,
    pub dev_nonce: u16,
    pub net_id: NetId,
}

/// Session keys derived for one accepted join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKeys {
    Legacy {
        nwk_s_key: AesKey,
        app_s_key: AesKey,
    },
    Split {
        f_nwk_s_int_key: AesKey,
        s_nwk_s_int_key: AesKey,
        nwk_s_enc_key: AesKey,
        app_s_key: AesKey,
    },
}

impl SessionKeys {
    pub fn app_s_key(&self) -> &AesKey {
        match self {
            SessionKeys::Legacy { app_s_key, .. } | SessionKeys::Split { app_s_key, .. } => {
                app_s_key
            }
        }
    }
}

/// Derive the session keys for an accepted join.
pub fn derive(
    root: &RootKeySet,
    version: MacVersion,
    input: &DerivationInput,
) -> Result<SessionKeys, JoinError> {
    match version.scheme() {
        KeyScheme::Legacy => Ok(derive_legacy(root.root_key(KeyScheme::Legacy), input)),
        KeyScheme::Current => {
            let app_key = root.app_key.as_ref().ok_or(JoinError::MissingRootKey("AppKey"))?;
            Ok(derive_current(&root.nwk_key, app_key, input))
        }
    }
}

fn join_nonce_bytes(join_nonce: u32) -> [u8; 3] {
    let b = join_nonce.to_le_bytes();
    [b[0], b[1], b[2]]
}

/// 1.0.x: tag | JoinNonce | NetID | DevNonce | pad16
fn legacy_block(tag: u8, input: &DerivationInput) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[1..4].copy_from_slice(&join_nonce_bytes(input.join_nonce));
    block[4..7].copy_from_slice(&input.net_id.to_le_bytes());
    block[7..9].copy_from_slice(&input.dev_nonce.to_le_bytes());
    block
}

/// 1.1: tag | JoinNonce | JoinEUI | DevNonce | pad16
fn current_block(tag: u8, input: &DerivationInput) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[1..4].copy_from_slice(&join_nonce_bytes(input.join_nonce));
    block[4..12].copy_from_slice(&input.join_eui.to_le_bytes());
    block[12..14].copy_from_slice(&input.dev_nonce.to_le_bytes());
    block
}

fn derive_legacy(root: &AesKey, input: &DerivationInput) -> SessionKeys {
    SessionKeys::Legacy {
        nwk_s_key: AesKey(aes128_encrypt(root, legacy_block(0x01, input))),
        app_s_key: AesKey(aes128_encrypt(root, legacy_block(0x02, input))),
    }
}

fn derive_current(nwk_key: &AesKey, app_key: &AesKey, input: &DerivationInput) -> SessionKeys {
    SessionKeys::Split {
        f_nwk_s_int_key: AesKey(aes128_encrypt(nwk_key, current_block(0x01, input))),
        app_s_key: AesKey(aes128_encrypt(app_key, current_block(0x02, input))),
        s_nwk_s_int_key: AesKey(aes128_encrypt(nwk_key, current_block(0x03, input))),
        nwk_s_enc_key: AesKey(aes128_encrypt(nwk_key, current_block(0x04, input))),
    }
}

/// JSIntKey, the 1.1 Join-Accept MIC key: aes128(NwkKey, 0x06 | DevEUI | pad16)
pub fn js_int_key(nwk_key: &AesKey, dev_eui: Eui64) -> AesKey {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = 0x06;
    block[1..9].copy_from_slice(&dev_eui.to_le_bytes());
    AesKey(aes128_encrypt(nwk_key, block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::crypto::aes128_decrypt;

    const NWK_KEY: AesKey = AesKey::new([
        0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F,
        0x3C,
    ]);
    const APP_KEY: AesKey = AesKey::new([0x5A; 16]);

    fn input() -> DerivationInput {
        DerivationInput {
            join_eui: Eui64::from_u64(0x0102030405060708),
            dev_eui: Eui64::from_u64(0x0807060504030201),
            join_nonce: 1,
            dev_nonce: 0,
            net_id: NetId::new(0x000013),
        }
    }

    fn root() -> RootKeySet {
        RootKeySet {
            nwk_key: NWK_KEY,
            app_key: Some(APP_KEY),
        }
    }

    #[test]
    fn test_current_scheme_yields_four_distinct_keys() {
        let keys = derive(&root(), MacVersion::V1_1, &input()).unwrap();

        let SessionKeys::Split {
            f_nwk_s_int_key,
            s_nwk_s_int_key,
            nwk_s_enc_key,
            app_s_key,
        } = keys
        else {
            panic!("Expected split session keys");
        };

        let all = [f_nwk_s_int_key, s_nwk_s_int_key, nwk_s_enc_key, app_s_key];
        for (i, a) in all.iter().enumerate() {
            assert_ne!(*a, NWK_KEY);
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let first = derive(&root(), MacVersion::V1_1, &input()).unwrap();
        let second = derive(&root(), MacVersion::V1_1, &input()).unwrap();
        assert_eq!(first, second);

        let legacy_a = derive(&root(), MacVersion::V1_0_2, &input()).unwrap();
        let legacy_b = derive(&root(), MacVersion::V1_0_2, &input()).unwrap();
        assert_eq!(legacy_a, legacy_b);
    }

    #[test]
    fn test_current_block_layout() {
        let keys = derive(&root(), MacVersion::V1_1, &input()).unwrap();
        let SessionKeys::Split {
            f_nwk_s_int_key,
            app_s_key,
            ..
        } = keys
        else {
            panic!("Expected split session keys");
        };

        let block = aes128_decrypt(&NWK_KEY, *f_nwk_s_int_key.as_bytes());
        assert_eq!(
            block,
            [
                0x01, 0x01, 0x00, 0x00, // tag, JoinNonce
                0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // JoinEUI
                0x00, 0x00, // DevNonce
                0x00, 0x00, // pad
            ]
        );

        // AppSKey comes from AppKey, not NwkKey
        let block = aes128_decrypt(&APP_KEY, *app_s_key.as_bytes());
        assert_eq!(block[0], 0x02);
    }

    #[test]
    fn test_legacy_block_layout() {
        let mut inp = input();
        inp.dev_nonce = 0x0102;
        let keys = derive(&root(), MacVersion::V1_0_3, &inp).unwrap();
        let SessionKeys::Legacy {
            nwk_s_key,
            app_s_key,
        } = keys
        else {
            panic!("Expected legacy session keys");
        };

        // legacy root key is AppKey when provisioned
        let block = aes128_decrypt(&APP_KEY, *nwk_s_key.as_bytes());
        assert_eq!(
            block,
            [0x01, 0x01, 0x00, 0x00, 0x13, 0x00, 0x00, 0x02, 0x01, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(aes128_decrypt(&APP_KEY, *app_s_key.as_bytes())[0], 0x02);
    }

    #[test]
    fn test_legacy_falls_back_to_nwk_key() {
        let root = RootKeySet {
            nwk_key: NWK_KEY,
            app_key: None,
        };
        let keys = derive(&root, MacVersion::V1_0, &input()).unwrap();
        let SessionKeys::Legacy { nwk_s_key, .. } = keys else {
            panic!("Expected legacy session keys");
        };
        assert_eq!(aes128_decrypt(&NWK_KEY, *nwk_s_key.as_bytes())[0], 0x01);
    }

    #[test]
    fn test_current_requires_app_key() {
        let root = RootKeySet {
            nwk_key: NWK_KEY,
            app_key: None,
        };
        assert!(matches!(
            derive(&root, MacVersion::V1_1, &input()),
            Err(JoinError::MissingRootKey("AppKey"))
        ));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", NWK_KEY), "AesKey(..)");
    }
}
