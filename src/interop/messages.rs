//! LoRaWAN Backend Interfaces JoinReq / JoinAns messages
//!
//! Envelopes are JSON objects using the Backend Interfaces field names.
//! Binary fields (PHYPayload, keys, DLSettings, CFList) are hex strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CodecError;
use crate::lorawan::{DevAddr, Eui64, NetId};

/// Binary field carried as a hex string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

impl HexBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode_upper(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map(Self).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    JoinReq,
    JoinAns,
}

/// Backend Interfaces result codes used by the join server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    MalformedMessage,
    UnknownSender,
    UnknownReceiver,
    #[serde(rename = "UnknownDevEUI")]
    UnknownDevEui,
    StaleDevNonce,
    NoRoamingAgreement,
    DeactivatedEndDevice,
    UnsupportedVersion,
    InvalidProtocolVersion,
    Superseded,
    Cancelled,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultObject {
    #[serde(rename = "ResultCode")]
    pub result_code: ResultCode,
    #[serde(rename = "Description", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A session key wrapped under a KEK shared with the receiving server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    #[serde(rename = "KEKLabel")]
    pub kek_label: String,
    #[serde(rename = "AESKey")]
    pub aes_key: HexBytes,
}

/// Join request forwarded by a network server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReq {
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "SenderID")]
    pub sender_id: NetId,
    #[serde(rename = "ReceiverID")]
    pub receiver_id: Eui64,
    #[serde(rename = "TransactionID")]
    pub transaction_id: u32,
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,
    #[serde(rename = "MACVersion")]
    pub mac_version: String,
    #[serde(rename = "PHYPayload")]
    pub phy_payload: HexBytes,
    #[serde(rename = "DevEUI")]
    pub dev_eui: Eui64,
    #[serde(rename = "DevAddr")]
    pub dev_addr: DevAddr,
    #[serde(rename = "DLSettings")]
    pub dl_settings: HexBytes,
    #[serde(rename = "RxDelay")]
    pub rx_delay: u8,
    #[serde(rename = "CFList", default, skip_serializing_if = "Option::is_none")]
    pub cf_list: Option<HexBytes>,
}

/// Join answer returned to the network server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAns {
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "SenderID", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Eui64>,
    #[serde(rename = "ReceiverID", default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<NetId>,
    #[serde(rename = "TransactionID")]
    pub transaction_id: u32,
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,
    #[serde(rename = "Result")]
    pub result: ResultObject,
    #[serde(rename = "PHYPayload", default, skip_serializing_if = "Option::is_none")]
    pub phy_payload: Option<HexBytes>,
    #[serde(rename = "SessionKeyID", default, skip_serializing_if = "Option::is_none")]
    pub session_key_id: Option<String>,
    #[serde(rename = "Lifetime", default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u32>,
    #[serde(rename = "NwkSKey", default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_key: Option<KeyEnvelope>,
    #[serde(rename = "FNwkSIntKey", default, skip_serializing_if = "Option::is_none")]
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    #[serde(rename = "SNwkSIntKey", default, skip_serializing_if = "Option::is_none")]
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    #[serde(rename = "NwkSEncKey", default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_enc_key: Option<KeyEnvelope>,
    #[serde(rename = "AppSKey", default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<KeyEnvelope>,
}

/// Envelope fields echoed back in every answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerHeader {
    pub protocol_version: String,
    pub sender_id: Option<Eui64>,
    pub receiver_id: Option<NetId>,
    pub transaction_id: u32,
}

impl AnswerHeader {
    /// Header for answering `req`: sender and receiver swap roles. An
    /// unsupported protocol version is answered in the oldest one we speak.
    pub fn for_request(req: &JoinReq) -> Self {
        let version = req.protocol_version.as_str();
        let protocol_version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            version
        } else {
            SUPPORTED_PROTOCOL_VERSIONS[0]
        };

        Self {
            protocol_version: protocol_version.to_string(),
            sender_id: Some(req.receiver_id),
            receiver_id: Some(req.sender_id),
            transaction_id: req.transaction_id,
        }
    }

    /// Best-effort header for a request whose envelope did not decode.
    pub fn salvage(raw: &[u8], peer: Option<NetId>) -> Self {
        let value: serde_json::Value = serde_json::from_slice(raw).unwrap_or_default();
        let field = |name: &str| value.get(name).and_then(|v| v.as_str());

        Self {
            protocol_version: field("ProtocolVersion")
                .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
                .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
                .to_string(),
            sender_id: field("ReceiverID").and_then(|v| v.parse().ok()),
            receiver_id: peer.or_else(|| field("SenderID").and_then(|v| v.parse().ok())),
            transaction_id: value
                .get("TransactionID")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0),
        }
    }
}

/// Backend Interfaces protocol versions this server speaks
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 2] = ["1.0", "1.1"];

impl JoinAns {
    fn empty(header: AnswerHeader, result: ResultObject) -> Self {
        Self {
            protocol_version: header.protocol_version,
            sender_id: header.sender_id,
            receiver_id: header.receiver_id,
            transaction_id: header.transaction_id,
            message_type: MessageType::JoinAns,
            result,
            phy_payload: None,
            session_key_id: None,
            lifetime: None,
            nwk_s_key: None,
            f_nwk_s_int_key: None,
            s_nwk_s_int_key: None,
            nwk_s_enc_key: None,
            app_s_key: None,
        }
    }

    /// A complete reject answer: envelope and result only, no key payload.
    pub fn reject(header: AnswerHeader, code: ResultCode, description: impl Into<String>) -> Self {
        Self::empty(
            header,
            ResultObject {
                result_code: code,
                description: description.into(),
            },
        )
    }

    /// A success answer without keys; the assembler fills in the payload.
    pub fn success(header: AnswerHeader) -> Self {
        Self::empty(
            header,
            ResultObject {
                result_code: ResultCode::Success,
                description: String::new(),
            },
        )
    }

    pub fn is_success(&self) -> bool {
        self.result.result_code == ResultCode::Success
    }
}

/// Decode a JoinReq envelope, checking message type and field lengths.
pub fn decode_join_req(raw: &[u8]) -> Result<JoinReq, CodecError> {
    let req: JoinReq = serde_json::from_slice(raw)?;

    if req.message_type != MessageType::JoinReq {
        return Err(CodecError::UnexpectedMessageType {
            expected: "JoinReq",
            actual: format!("{:?}", req.message_type),
        });
    }
    if req.dl_settings.len() != 1 {
        return Err(CodecError::InvalidLength {
            field: "DLSettings",
            expected: 1,
            actual: req.dl_settings.len(),
        });
    }
    if let Some(cf_list) = &req.cf_list {
        if cf_list.len() != 16 {
            return Err(CodecError::InvalidLength {
                field: "CFList",
                expected: 16,
                actual: cf_list.len(),
            });
        }
    }
    Ok(req)
}

pub fn encode_join_req(req: &JoinReq) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(req)?)
}

pub fn encode_join_ans(ans: &JoinAns) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(ans)?)
}

pub fn decode_join_ans(raw: &[u8]) -> Result<JoinAns, CodecError> {
    let ans: JoinAns = serde_json::from_slice(raw)?;
    if ans.message_type != MessageType::JoinAns {
        return Err(CodecError::UnexpectedMessageType {
            expected: "JoinAns",
            actual: format!("{:?}", ans.message_type),
        });
    }
    Ok(ans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"{
            "ProtocolVersion": "1.1",
            "SenderID": "000013",
            "ReceiverID": "0102030405060708",
            "TransactionID": 42,
            "MessageType": "JoinReq",
            "MACVersion": "1.1",
            "PHYPayload": "0008070605040302010102030405060708420000000000",
            "DevEUI": "0807060504030201",
            "DevAddr": "01AB5678",
            "DLSettings": "00",
            "RxDelay": 1
        }"#
        .to_string()
    }

    #[test]
    fn test_decode_join_req() {
        let req = decode_join_req(sample_json().as_bytes()).unwrap();

        assert_eq!(req.sender_id, NetId::new(0x13));
        assert_eq!(req.receiver_id, Eui64::from_u64(0x0102030405060708));
        assert_eq!(req.transaction_id, 42);
        assert_eq!(req.dev_addr, DevAddr::new(0x01AB5678));
        assert_eq!(req.phy_payload.len(), 23);
        assert!(req.cf_list.is_none());
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        let json = sample_json().replace("\"DLSettings\": \"00\"", "\"DLSettings\": \"0000\"");
        assert!(matches!(
            decode_join_req(json.as_bytes()),
            Err(CodecError::InvalidLength { field: "DLSettings", .. })
        ));

        let json = sample_json().replace("\"0102030405060708\"", "\"01020304\"");
        assert!(matches!(
            decode_join_req(json.as_bytes()),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_decode_rejects_answer_envelope() {
        let json = sample_json().replace("\"JoinReq\"", "\"JoinAns\"");
        let err = decode_join_req(json.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedMessageType {
                expected: "JoinReq",
                ..
            }
        ));
        assert_eq!(err.to_string(), "unexpected MessageType JoinAns, expected JoinReq");

        let err = decode_join_ans(sample_json().as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedMessageType {
                expected: "JoinAns",
                ..
            }
        ));
    }

    #[test]
    fn test_reject_answer_has_no_key_payload() {
        let req = decode_join_req(sample_json().as_bytes()).unwrap();
        let ans = JoinAns::reject(
            AnswerHeader::for_request(&req),
            ResultCode::StaleDevNonce,
            "stale",
        );

        let value: serde_json::Value =
            serde_json::from_slice(&encode_join_ans(&ans).unwrap()).unwrap();
        assert_eq!(value["MessageType"], "JoinAns");
        assert_eq!(value["SenderID"], "0102030405060708");
        assert_eq!(value["ReceiverID"], "000013");
        assert_eq!(value["TransactionID"], 42);
        assert_eq!(value["Result"]["ResultCode"], "StaleDevNonce");
        assert!(value.get("PHYPayload").is_none());
        assert!(value.get("AppSKey").is_none());
        assert!(value.get("SessionKeyID").is_none());
    }

    #[test]
    fn test_salvage_header_from_garbage() {
        let header = AnswerHeader::salvage(b"not json", Some(NetId::new(0x13)));
        assert_eq!(header.protocol_version, "1.0");
        assert_eq!(header.receiver_id, Some(NetId::new(0x13)));
        assert_eq!(header.sender_id, None);
        assert_eq!(header.transaction_id, 0);

        let partial = br#"{"TransactionID": 7, "ReceiverID": "0102030405060708", "ProtocolVersion": "1.1"}"#;
        let header = AnswerHeader::salvage(partial, None);
        assert_eq!(header.transaction_id, 7);
        assert_eq!(header.protocol_version, "1.1");
        assert_eq!(header.sender_id, Some(Eui64::from_u64(0x0102030405060708)));
    }

    #[test]
    fn test_unknown_dev_eui_code_name() {
        assert_eq!(
            serde_json::to_string(&ResultCode::UnknownDevEui).unwrap(),
            "\"UnknownDevEUI\""
        );
    }
}
