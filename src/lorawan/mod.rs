pub mod crypto;
pub mod encoder;
pub mod keys;

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::str::FromStr;

use crate::error::{CodecError, JoinError};
use keys::AesKey;

/// Serialize through `Display` and deserialize through `FromStr`, so hex
/// identifiers read the same in JSON, TOML and log lines.
macro_rules! string_serde {
    ($t:ty) => {
        impl ::serde::Serialize for $t {
            fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.collect_str(self)
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $t {
            fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = <String as ::serde::Deserialize>::deserialize(d)?;
                s.parse().map_err(::serde::de::Error::custom)
            }
        }
    };
}
pub(crate) use string_serde;

/// Decode a hex string into exactly `N` bytes.
pub(crate) fn decode_hex_array<const N: usize>(
    field: &'static str,
    s: &str,
) -> Result<[u8; N], CodecError> {
    let bytes = hex::decode(s)?;
    bytes.as_slice().try_into().map_err(|_| CodecError::InvalidLength {
        field,
        expected: N,
        actual: bytes.len(),
    })
}

/// 64-bit extended unique identifier (JoinEUI, DevEUI).
///
/// Stored in display (big-endian) order; LoRaWAN frames carry it
/// little-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui64([u8; 8]);

impl Eui64 {
    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn from_le_bytes(mut bytes: [u8; 8]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.as_u64())
    }
}

impl FromStr for Eui64 {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex_array::<8>("EUI-64", s).map(Self)
    }
}

string_serde!(Eui64);

/// 24-bit LoRaWAN network identifier. Network servers use it as SenderID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetId(u32);

impl NetId {
    pub const fn new(value: u32) -> Self {
        Self(value & 0x00FF_FFFF)
    }

    pub fn to_le_bytes(&self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}", self.0)
    }
}

impl FromStr for NetId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = decode_hex_array::<3>("NetID", s)?;
        Ok(Self(u32::from_be_bytes([0, b[0], b[1], b[2]])))
    }
}

string_serde!(NetId);

/// 32-bit device address assigned by the network server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DevAddr(u32);

impl DevAddr {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for DevAddr {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex_array::<4>("DevAddr", s).map(|b| Self(u32::from_be_bytes(b)))
    }
}

string_serde!(DevAddr);

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    /// MHDR byte for this message type with Major = LoRaWAN R1.
    pub fn mhdr(self) -> u8 {
        let bits = match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }
}

impl From<u8> for MType {
    fn from(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::RejoinRequest => write!(f, "RejoinRequest"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// Key derivation scheme, selected by MAC version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheme {
    /// LoRaWAN 1.0.x: one root key, NwkSKey + AppSKey.
    Legacy,
    /// LoRaWAN 1.1: NwkKey and AppKey, four session keys.
    Current,
}

impl KeyScheme {
    /// Largest DevNonce the device may ever use.
    pub fn dev_nonce_max(self) -> u16 {
        match self {
            KeyScheme::Legacy => 0x3FFF,
            KeyScheme::Current => 0xFFFF,
        }
    }
}

/// Supported LoRaWAN MAC versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacVersion {
    V1_0,
    V1_0_1,
    V1_0_2,
    V1_0_3,
    V1_0_4,
    V1_1,
}

impl MacVersion {
    pub fn scheme(self) -> KeyScheme {
        match self {
            MacVersion::V1_1 => KeyScheme::Current,
            _ => KeyScheme::Legacy,
        }
    }
}

impl fmt::Display for MacVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MacVersion::V1_0 => "1.0",
            MacVersion::V1_0_1 => "1.0.1",
            MacVersion::V1_0_2 => "1.0.2",
            MacVersion::V1_0_3 => "1.0.3",
            MacVersion::V1_0_4 => "1.0.4",
            MacVersion::V1_1 => "1.1",
        };
        f.write_str(s)
    }
}

impl FromStr for MacVersion {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" | "1.0.0" => Ok(MacVersion::V1_0),
            "1.0.1" => Ok(MacVersion::V1_0_1),
            "1.0.2" => Ok(MacVersion::V1_0_2),
            "1.0.3" => Ok(MacVersion::V1_0_3),
            "1.0.4" => Ok(MacVersion::V1_0_4),
            "1.1" | "1.1.0" => Ok(MacVersion::V1_1),
            other => Err(JoinError::UnsupportedVersion(other.to_string())),
        }
    }
}

string_serde!(MacVersion);

/// MHDR(1) + JoinEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4)
pub const JOIN_REQUEST_LEN: usize = 23;

/// Decoded Join-Request PHYPayload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestFrame {
    pub mhdr: u8,
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: u16,
    pub mic: [u8; 4],
}

impl JoinRequestFrame {
    /// Build a Join-Request and sign it with the device root key.
    pub fn signed(join_eui: Eui64, dev_eui: Eui64, dev_nonce: u16, key: &AesKey) -> Self {
        let mut frame = Self {
            mhdr: MType::JoinRequest.mhdr(),
            join_eui,
            dev_eui,
            dev_nonce,
            mic: [0; 4],
        };
        frame.mic = crypto::mic(key, &[&frame.signed_bytes()]);
        frame
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != JOIN_REQUEST_LEN {
            return Err(CodecError::InvalidLength {
                field: "PHYPayload",
                expected: JOIN_REQUEST_LEN,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let mhdr = buf.get_u8();
        let mtype = MType::from(mhdr);
        if mtype != MType::JoinRequest {
            return Err(CodecError::UnexpectedMType(mtype.to_string()));
        }
        if mhdr & 0x03 != 0 {
            return Err(CodecError::UnsupportedMajor(mhdr & 0x03));
        }

        let join_eui = Eui64::from_le_bytes(buf.get_u64_le().to_le_bytes());
        let dev_eui = Eui64::from_le_bytes(buf.get_u64_le().to_le_bytes());
        let dev_nonce = buf.get_u16_le();
        let mut mic = [0u8; 4];
        buf.copy_to_slice(&mut mic);

        Ok(Self {
            mhdr,
            join_eui,
            dev_eui,
            dev_nonce,
            mic,
        })
    }

    /// MHDR | JoinEUI | DevEUI | DevNonce, the bytes covered by the MIC.
    pub fn signed_bytes(&self) -> [u8; JOIN_REQUEST_LEN - 4] {
        let mut buf = BytesMut::with_capacity(JOIN_REQUEST_LEN - 4);
        buf.put_u8(self.mhdr);
        buf.put_slice(&self.join_eui.to_le_bytes());
        buf.put_slice(&self.dev_eui.to_le_bytes());
        buf.put_u16_le(self.dev_nonce);

        let mut out = [0u8; JOIN_REQUEST_LEN - 4];
        out.copy_from_slice(&buf);
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.signed_bytes().to_vec();
        out.extend_from_slice(&self.mic);
        out
    }

    /// Check the MIC against the root key in constant time.
    pub fn verify_mic(&self, key: &AesKey) -> bool {
        crypto::mic_matches(&crypto::mic(key, &[&self.signed_bytes()]), &self.mic)
    }
}

impl fmt::Display for JoinRequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JoinRequest JoinEUI={} DevEUI={} DevNonce={} MIC={}",
            self.join_eui,
            self.dev_eui,
            self.dev_nonce,
            hex::encode_upper(self.mic)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Vec<u8> {
        vec![
            0x00, // MHDR (JoinRequest)
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // JoinEUI (LE)
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // DevEUI (LE)
            0x42, 0x00, // DevNonce
            0xEF, 0xBE, 0xAD, 0xDE, // MIC
        ]
    }

    #[test]
    fn test_decode_join_request() {
        let frame = JoinRequestFrame::decode(&sample_request()).unwrap();

        assert_eq!(frame.join_eui, Eui64::from_u64(0x0102030405060708));
        assert_eq!(frame.dev_eui, Eui64::from_u64(0x0807060504030201));
        assert_eq!(frame.dev_nonce, 0x0042);
        assert_eq!(frame.mic, [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(frame.encode(), sample_request());
    }

    #[test]
    fn test_wrong_length_fails() {
        let mut data = sample_request();
        data.push(0x00);
        assert!(matches!(
            JoinRequestFrame::decode(&data),
            Err(CodecError::InvalidLength { actual: 24, .. })
        ));
    }

    #[test]
    fn test_data_frame_rejected() {
        let mut data = sample_request();
        data[0] = 0x40; // UnconfirmedDataUp
        assert!(matches!(
            JoinRequestFrame::decode(&data),
            Err(CodecError::UnexpectedMType(_))
        ));
    }

    #[test]
    fn test_unknown_major_rejected() {
        let mut data = sample_request();
        data[0] = 0x01;
        assert!(matches!(
            JoinRequestFrame::decode(&data),
            Err(CodecError::UnsupportedMajor(1))
        ));
    }

    #[test]
    fn test_signed_frame_verifies() {
        let key = AesKey::new([0x2B; 16]);
        let frame = JoinRequestFrame::signed(
            Eui64::from_u64(1),
            Eui64::from_u64(2),
            7,
            &key,
        );

        assert!(frame.verify_mic(&key));
        assert!(!frame.verify_mic(&AesKey::new([0x2C; 16])));

        let mut tampered = frame.clone();
        tampered.dev_nonce = 8;
        assert!(!tampered.verify_mic(&key));
    }

    #[test]
    fn test_identifier_parsing() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(eui.to_string(), "0102030405060708");
        assert_eq!(eui.to_le_bytes()[0], 0x08);

        let net_id: NetId = "000013".parse().unwrap();
        assert_eq!(net_id, NetId::new(0x13));
        assert_eq!(net_id.to_le_bytes(), [0x13, 0x00, 0x00]);

        assert!("0102".parse::<Eui64>().is_err());
        assert!("zz0013".parse::<NetId>().is_err());
    }

    #[test]
    fn test_mac_version_parsing() {
        assert_eq!("1.0.2".parse::<MacVersion>().unwrap(), MacVersion::V1_0_2);
        assert_eq!("1.1".parse::<MacVersion>().unwrap().scheme(), KeyScheme::Current);
        assert!(matches!(
            "1.2".parse::<MacVersion>(),
            Err(JoinError::UnsupportedVersion(v)) if v == "1.2"
        ));
    }
}
