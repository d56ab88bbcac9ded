//! JoinReq processing
//!
//! Each request moves through
//! `Received → Authenticated → NonceValidated → KeysDerived → Committed →
//! Answered`, or drops to `Rejected` from any point before `Committed`.
//! Nothing is written to the registry until the nonce-state commit, so a
//! rejected or cancelled request leaves the device exactly as it was.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::answer::{self, Peer};
use super::context::RequestContext;
use super::freshness;
use super::messages::{
    decode_join_req, encode_join_ans, AnswerHeader, JoinAns, JoinReq, MessageType,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::error::{CodecError, ErrorClass, JoinError, RegistryError};
use crate::lorawan::keys::{self, DerivationInput};
use crate::lorawan::{Eui64, JoinRequestFrame, MacVersion, NetId};
use crate::registry::{DeviceIdentity, KeyRegistry, RoamingAgreements};

/// Processing state of one join transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Received,
    Authenticated,
    NonceValidated,
    KeysDerived,
    Committed,
    Answered,
    Rejected,
}

impl JoinState {
    fn successor(self) -> Option<JoinState> {
        match self {
            JoinState::Received => Some(JoinState::Authenticated),
            JoinState::Authenticated => Some(JoinState::NonceValidated),
            JoinState::NonceValidated => Some(JoinState::KeysDerived),
            JoinState::KeysDerived => Some(JoinState::Committed),
            JoinState::Committed => Some(JoinState::Answered),
            JoinState::Answered | JoinState::Rejected => None,
        }
    }

    fn is_terminal(self) -> bool {
        self.successor().is_none()
    }
}

#[derive(Debug)]
struct Transaction {
    id: u32,
    state: JoinState,
}

impl Transaction {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: JoinState::Received,
        }
    }

    fn advance(&mut self, next: JoinState) -> Result<(), JoinError> {
        if self.state.successor() != Some(next) {
            return Err(JoinError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Transaction {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    fn reject(&mut self) -> JoinState {
        let failed_at = self.state;
        if !failed_at.is_terminal() {
            self.state = JoinState::Rejected;
        }
        failed_at
    }
}

/// Result of handling one request. Every request yields exactly one answer.
#[derive(Debug)]
pub struct JoinOutcome {
    pub answer: JoinAns,
    pub state: JoinState,
    pub rejection: Option<JoinError>,
}

impl JoinOutcome {
    fn rejected(header: AnswerHeader, err: JoinError) -> Self {
        let description = match err.class() {
            ErrorClass::Internal => "internal error".to_string(),
            _ => err.to_string(),
        };
        Self {
            answer: JoinAns::reject(header, err.result_code(), description),
            state: JoinState::Rejected,
            rejection: Some(err),
        }
    }
}

/// The join server: validates JoinReqs from network servers and answers
/// them with a Join-Accept and wrapped session keys.
pub struct JoinServer {
    registry: Arc<dyn KeyRegistry>,
    agreements: Arc<dyn RoamingAgreements>,
    peers: HashMap<NetId, Peer>,
    join_euis: HashSet<Eui64>,
    session_lifetime: Option<u32>,
}

impl JoinServer {
    pub fn new(registry: Arc<dyn KeyRegistry>, agreements: Arc<dyn RoamingAgreements>) -> Self {
        Self {
            registry,
            agreements,
            peers: HashMap::new(),
            join_euis: HashSet::new(),
            session_lifetime: None,
        }
    }

    pub fn with_peer(mut self, peer: Peer) -> Self {
        self.peers.insert(peer.net_id, peer);
        self
    }

    pub fn serve_join_eui(mut self, join_eui: Eui64) -> Self {
        self.join_euis.insert(join_eui);
        self
    }

    /// Lifetime in seconds advertised with every session.
    pub fn with_session_lifetime(mut self, seconds: u32) -> Self {
        self.session_lifetime = Some(seconds);
        self
    }

    /// Decode, handle and encode one wire request.
    ///
    /// Undecodable requests are still answered, with a `MalformedMessage`
    /// answer built from whatever envelope fields could be recovered.
    pub async fn handle_raw(
        &self,
        raw: &[u8],
        authenticated: Option<NetId>,
        ctx: &mut RequestContext,
    ) -> Result<Vec<u8>, CodecError> {
        let outcome = match decode_join_req(raw) {
            Ok(req) => self.handle(&req, authenticated, ctx).await,
            Err(e) => {
                let err = JoinError::from(e);
                warn!("Undecodable JoinReq from {:?}: {}", authenticated, err);
                JoinOutcome::rejected(AnswerHeader::salvage(raw, authenticated), err)
            }
        };
        encode_join_ans(&outcome.answer)
    }

    /// Handle a decoded JoinReq sent by the network server `authenticated`
    /// (as identified by the transport; `None` when it could not tell).
    pub async fn handle(
        &self,
        req: &JoinReq,
        authenticated: Option<NetId>,
        ctx: &mut RequestContext,
    ) -> JoinOutcome {
        let mut txn = Transaction::new(req.transaction_id);
        debug!(
            "Transaction {}: JoinReq from {} for {} (DevEUI {})",
            txn.id, req.sender_id, req.receiver_id, req.dev_eui
        );

        match self.process(&mut txn, req, authenticated, ctx).await {
            Ok(answer) => {
                info!(
                    "Transaction {}: join accepted for DevEUI {} via {} (SessionKeyID {})",
                    txn.id,
                    req.dev_eui,
                    req.sender_id,
                    answer.session_key_id.as_deref().unwrap_or("-")
                );
                JoinOutcome {
                    answer,
                    state: txn.state,
                    rejection: None,
                }
            }
            Err(err) => {
                let failed_at = txn.reject();
                match err.class() {
                    ErrorClass::Internal => error!(
                        "Transaction {}: failed in {:?}: {}",
                        txn.id, failed_at, err
                    ),
                    class => warn!(
                        "Transaction {}: rejected in {:?} ({:?}): {}",
                        txn.id, failed_at, class, err
                    ),
                }
                JoinOutcome::rejected(AnswerHeader::for_request(req), err)
            }
        }
    }

    async fn process(
        &self,
        txn: &mut Transaction,
        req: &JoinReq,
        authenticated: Option<NetId>,
        ctx: &mut RequestContext,
    ) -> Result<JoinAns, JoinError> {
        let (peer, version) = self.check_envelope(req, authenticated)?;

        let frame = JoinRequestFrame::decode(req.phy_payload.as_slice())?;
        if frame.dev_eui != req.dev_eui {
            return Err(JoinError::Malformed(format!(
                "DevEUI {} does not match PHYPayload DevEUI {}",
                req.dev_eui, frame.dev_eui
            )));
        }
        if frame.join_eui != req.receiver_id {
            return Err(JoinError::Malformed(format!(
                "ReceiverID {} does not match PHYPayload JoinEUI {}",
                req.receiver_id, frame.join_eui
            )));
        }
        debug!("Transaction {}: {}", txn.id, frame);
        let identity = DeviceIdentity::new(frame.join_eui, frame.dev_eui);

        let agreed = ctx
            .run(self.agreements.has_agreement(frame.join_eui, peer.net_id))
            .await?
            .map_err(|e| registry_error(e, identity))?;
        if !agreed {
            return Err(JoinError::NoRoamingAgreement {
                join_eui: frame.join_eui,
                net_id: peer.net_id,
            });
        }

        let record = ctx
            .run(self.registry.lookup(&identity))
            .await?
            .map_err(|e| registry_error(e, identity))?;
        // MIC before any device-status check: status is never revealed for an unauthenticated frame
        let scheme = version.scheme();
        if !frame.verify_mic(record.root_keys.root_key(scheme)) {
            return Err(JoinError::IntegrityCheckFailed);
        }
        if record.deactivated {
            return Err(JoinError::Deactivated(identity));
        }
        if let Some(provisioned) = record.mac_version {
            if provisioned.scheme() != scheme {
                return Err(JoinError::MacVersionMismatch {
                    provisioned,
                    requested: version,
                });
            }
        }
        ctx.check()?;
        txn.advance(JoinState::Authenticated)?;

        let fresh = freshness::check(&record.nonce_state, frame.dev_nonce, version)?;
        ctx.check()?;
        txn.advance(JoinState::NonceValidated)?;

        let input = DerivationInput {
            join_eui: frame.join_eui,
            dev_eui: frame.dev_eui,
            join_nonce: fresh.join_nonce,
            dev_nonce: fresh.dev_nonce,
            net_id: peer.net_id,
        };
        let session = keys::derive(&record.root_keys, version, &input)?;
        txn.advance(JoinState::KeysDerived)?;

        let join_accept = answer::join_accept(req, scheme, &record.root_keys, &input)?;
        let assembled = answer::assemble(&session, peer, fresh.join_nonce, join_accept)?;
        let answer = assembled.into_answer(AnswerHeader::for_request(req), self.session_lifetime);

        // last point at which cancellation is honoured: a committed join is always answered
        ctx.check()?;
        let next = record.nonce_state.advance(fresh);
        self.registry
            .commit_join(&identity, next, &record.nonce_state)
            .await
            .map_err(|e| match e {
                RegistryError::Conflict => JoinError::Superseded,
                other => registry_error(other, identity),
            })?;
        txn.advance(JoinState::Committed)?;

        txn.advance(JoinState::Answered)?;
        Ok(answer)
    }

    fn check_envelope(
        &self,
        req: &JoinReq,
        authenticated: Option<NetId>,
    ) -> Result<(&Peer, MacVersion), JoinError> {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&req.protocol_version.as_str()) {
            return Err(JoinError::InvalidProtocolVersion(req.protocol_version.clone()));
        }
        if req.message_type != MessageType::JoinReq {
            return Err(JoinError::Malformed(format!(
                "expected JoinReq, got {:?}",
                req.message_type
            )));
        }

        let peer = self
            .peers
            .get(&req.sender_id)
            .ok_or(JoinError::UnknownSender(req.sender_id))?;
        if authenticated != Some(req.sender_id) {
            return Err(JoinError::SenderMismatch {
                claimed: req.sender_id,
                authenticated,
            });
        }

        if !self.join_euis.contains(&req.receiver_id) {
            return Err(JoinError::UnknownReceiver(req.receiver_id));
        }

        let version: MacVersion = req.mac_version.parse()?;
        Ok((peer, version))
    }
}

fn registry_error(err: RegistryError, identity: DeviceIdentity) -> JoinError {
    match err {
        RegistryError::DeviceUnknown => JoinError::DeviceUnknown(identity),
        RegistryError::Unavailable(reason) => JoinError::RegistryUnavailable(reason),
        RegistryError::Conflict => JoinError::Superseded,
    }
}
