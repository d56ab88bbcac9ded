//! JoinAns assembly: key wrapping, SessionKeyID and the Join-Accept
//!
//! Session keys leave the join server only wrapped under the KEK shared
//! with the network server that asked for them.

use sha2::{Digest, Sha256};

use super::messages::{AnswerHeader, JoinAns, JoinReq, KeyEnvelope};
use crate::error::{CryptoError, JoinError};
use crate::lorawan::crypto::{key_unwrap, key_wrap};
use crate::lorawan::encoder::JoinAcceptBuilder;
use crate::lorawan::keys::{AesKey, DerivationInput, RootKeySet, SessionKeys};
use crate::lorawan::{KeyScheme, NetId};

/// A network server this join server exchanges keys with.
#[derive(Debug, Clone)]
pub struct Peer {
    pub net_id: NetId,
    pub kek_label: String,
    pub kek: AesKey,
}

impl Peer {
    fn envelope(&self, key: &AesKey) -> Result<KeyEnvelope, CryptoError> {
        Ok(KeyEnvelope {
            kek_label: self.kek_label.clone(),
            aes_key: key_wrap(&self.kek, key.as_bytes())?.into(),
        })
    }
}

/// Pieces of a success answer, ready to be placed into a [`JoinAns`].
#[derive(Debug, Clone)]
pub struct AssembledAnswer {
    pub session_key_id: String,
    pub phy_payload: Vec<u8>,
    pub nwk_s_key: Option<KeyEnvelope>,
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    pub nwk_s_enc_key: Option<KeyEnvelope>,
    pub app_s_key: KeyEnvelope,
}

impl AssembledAnswer {
    pub fn into_answer(self, header: AnswerHeader, lifetime: Option<u32>) -> JoinAns {
        let mut ans = JoinAns::success(header);
        ans.phy_payload = Some(self.phy_payload.into());
        ans.session_key_id = Some(self.session_key_id);
        ans.lifetime = lifetime;
        ans.nwk_s_key = self.nwk_s_key;
        ans.f_nwk_s_int_key = self.f_nwk_s_int_key;
        ans.s_nwk_s_int_key = self.s_nwk_s_int_key;
        ans.nwk_s_enc_key = self.nwk_s_enc_key;
        ans.app_s_key = Some(self.app_s_key);
        ans
    }
}

/// SessionKeyID: SHA-256 over JoinNonce and the wrapped AppSKey, truncated
/// to 128 bits.
pub fn session_key_id(join_nonce: u32, wrapped_app_s_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&join_nonce.to_le_bytes()[..3]);
    hasher.update(wrapped_app_s_key);
    hex::encode_upper(&hasher.finalize()[..16])
}

/// Wrap `keys` for `peer` and attach the Join-Accept.
pub fn assemble(
    keys: &SessionKeys,
    peer: &Peer,
    join_nonce: u32,
    join_accept: Vec<u8>,
) -> Result<AssembledAnswer, JoinError> {
    let app_s_key = peer.envelope(keys.app_s_key())?;
    let session_key_id = session_key_id(join_nonce, app_s_key.aes_key.as_slice());

    let mut answer = AssembledAnswer {
        session_key_id,
        phy_payload: join_accept,
        nwk_s_key: None,
        f_nwk_s_int_key: None,
        s_nwk_s_int_key: None,
        nwk_s_enc_key: None,
        app_s_key,
    };

    match keys {
        SessionKeys::Legacy { nwk_s_key, .. } => {
            answer.nwk_s_key = Some(peer.envelope(nwk_s_key)?);
        }
        SessionKeys::Split {
            f_nwk_s_int_key,
            s_nwk_s_int_key,
            nwk_s_enc_key,
            ..
        } => {
            answer.f_nwk_s_int_key = Some(peer.envelope(f_nwk_s_int_key)?);
            answer.s_nwk_s_int_key = Some(peer.envelope(s_nwk_s_int_key)?);
            answer.nwk_s_enc_key = Some(peer.envelope(nwk_s_enc_key)?);
        }
    }

    Ok(answer)
}

/// Build the encrypted Join-Accept answering `req`.
pub fn join_accept(
    req: &JoinReq,
    scheme: KeyScheme,
    root: &RootKeySet,
    input: &DerivationInput,
) -> Result<Vec<u8>, JoinError> {
    let dl_settings = match req.dl_settings.as_slice() {
        [dl_settings] => *dl_settings,
        other => {
            return Err(JoinError::Malformed(format!(
                "DLSettings must be 1 byte, got {}",
                other.len()
            )))
        }
    };
    let cf_list = req
        .cf_list
        .as_ref()
        .map(|c| {
            <[u8; 16]>::try_from(c.as_slice()).map_err(|_| {
                JoinError::Malformed(format!("CFList must be 16 bytes, got {}", c.len()))
            })
        })
        .transpose()?;

    let builder = JoinAcceptBuilder {
        join_nonce: input.join_nonce,
        net_id: input.net_id,
        dev_addr: req.dev_addr,
        dl_settings,
        rx_delay: req.rx_delay,
        cf_list,
    };
    Ok(builder.build(scheme, root, input.join_eui, input.dev_eui, input.dev_nonce))
}

/// Why a network server could not recover keys from an answer.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("answer carries no {0}")]
    MissingKey(&'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

fn open(
    kek: &AesKey,
    envelope: Option<&KeyEnvelope>,
    name: &'static str,
) -> Result<AesKey, OpenError> {
    let envelope = envelope.ok_or(OpenError::MissingKey(name))?;
    let plain = key_unwrap(kek, envelope.aes_key.as_slice())?;
    Ok(AesKey::from_slice(&plain)?)
}

/// Network-server side: recover the session keys from a success answer.
pub fn open_session_keys(ans: &JoinAns, kek: &AesKey) -> Result<SessionKeys, OpenError> {
    let app_s_key = open(kek, ans.app_s_key.as_ref(), "AppSKey")?;

    if ans.nwk_s_key.is_some() {
        return Ok(SessionKeys::Legacy {
            nwk_s_key: open(kek, ans.nwk_s_key.as_ref(), "NwkSKey")?,
            app_s_key,
        });
    }

    Ok(SessionKeys::Split {
        f_nwk_s_int_key: open(kek, ans.f_nwk_s_int_key.as_ref(), "FNwkSIntKey")?,
        s_nwk_s_int_key: open(kek, ans.s_nwk_s_int_key.as_ref(), "SNwkSIntKey")?,
        nwk_s_enc_key: open(kek, ans.nwk_s_enc_key.as_ref(), "NwkSEncKey")?,
        app_s_key,
    })
}
