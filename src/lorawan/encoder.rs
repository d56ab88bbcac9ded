//! LoRaWAN Join-Accept encoder
//!
//! Builds the encrypted Join-Accept PHYPayload the network server
//! forwards to the device.
//!
//! Frame structure:
//!   MHDR(1) | enc( JoinNonce(3,LE) | NetID(3,LE) | DevAddr(4,LE) |
//!                  DLSettings(1) | RxDelay(1) | [CFList(16)] | MIC(4) )
//!
//! The device decrypts with AES *encrypt*, so the join server encrypts with
//! AES decrypt, block by block.

use super::crypto::{aes128_decrypt, aes128_encrypt, mic, BLOCK_SIZE};
use super::keys::{js_int_key, AesKey, RootKeySet};
use super::{DevAddr, Eui64, KeyScheme, MType, NetId};

/// DLSettings bit signalling a 1.1 join server to the device
pub const OPT_NEG: u8 = 0x80;

/// JoinReqType for a plain Join-Request in the 1.1 Join-Accept MIC
const JOIN_REQ_TYPE: u8 = 0xFF;

/// Parameters for building a Join-Accept
#[derive(Debug, Clone)]
pub struct JoinAcceptBuilder {
    pub join_nonce: u32,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: u8,
    pub rx_delay: u8,
    pub cf_list: Option<[u8; 16]>,
}

impl JoinAcceptBuilder {
    /// Plaintext body without MHDR and MIC
    fn body(&self, scheme: KeyScheme) -> Vec<u8> {
        let mut body = Vec::with_capacity(28);
        body.extend_from_slice(&self.join_nonce.to_le_bytes()[..3]);
        body.extend_from_slice(&self.net_id.to_le_bytes());
        body.extend_from_slice(&self.dev_addr.as_u32().to_le_bytes());

        let dl_settings = match scheme {
            KeyScheme::Legacy => self.dl_settings & !OPT_NEG,
            KeyScheme::Current => self.dl_settings | OPT_NEG,
        };
        body.push(dl_settings);
        body.push(self.rx_delay);

        if let Some(cf_list) = &self.cf_list {
            body.extend_from_slice(cf_list);
        }
        body
    }

    /// Build the encrypted PHYPayload answering a Join-Request.
    pub fn build(
        &self,
        scheme: KeyScheme,
        root: &RootKeySet,
        join_eui: Eui64,
        dev_eui: Eui64,
        dev_nonce: u16,
    ) -> Vec<u8> {
        let mhdr = MType::JoinAccept.mhdr();
        let body = self.body(scheme);
        let key = root.root_key(scheme);

        let frame_mic = match scheme {
            KeyScheme::Legacy => mic(key, &[&[mhdr], &body]),
            KeyScheme::Current => {
                let int_key = js_int_key(&root.nwk_key, dev_eui);
                mic(
                    &int_key,
                    &[
                        &[JOIN_REQ_TYPE],
                        &join_eui.to_le_bytes(),
                        &dev_nonce.to_le_bytes(),
                        &[mhdr],
                        &body,
                    ],
                )
            }
        };

        let mut plain = body;
        plain.extend_from_slice(&frame_mic);

        let mut frame = Vec::with_capacity(1 + plain.len());
        frame.push(mhdr);
        for chunk in plain.chunks(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            frame.extend_from_slice(&aes128_decrypt(key, block));
        }
        frame
    }
}

/// Device-side decryption of a Join-Accept PHYPayload.
///
/// Returns the plaintext body including the trailing MIC, or `None` when
/// the frame is not a Join-Accept of a valid length.
pub fn decrypt_join_accept(key: &AesKey, phy_payload: &[u8]) -> Option<Vec<u8>> {
    let (&mhdr, encrypted) = phy_payload.split_first()?;
    if MType::from(mhdr) != MType::JoinAccept
        || !(encrypted.len() == 16 || encrypted.len() == 32)
    {
        return None;
    }

    let mut plain = Vec::with_capacity(encrypted.len());
    for chunk in encrypted.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(chunk);
        plain.extend_from_slice(&aes128_encrypt(key, block));
    }
    Some(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NWK_KEY: AesKey = AesKey::new([0x01; 16]);
    const APP_KEY: AesKey = AesKey::new([0x02; 16]);

    fn builder() -> JoinAcceptBuilder {
        JoinAcceptBuilder {
            join_nonce: 0x000102,
            net_id: NetId::new(0x000013),
            dev_addr: DevAddr::new(0x01AB5678),
            dl_settings: 0x00,
            rx_delay: 1,
            cf_list: None,
        }
    }

    #[test]
    fn test_build_legacy_join_accept() {
        let root = RootKeySet {
            nwk_key: NWK_KEY,
            app_key: Some(APP_KEY),
        };
        let frame = builder().build(
            KeyScheme::Legacy,
            &root,
            Eui64::from_u64(1),
            Eui64::from_u64(2),
            3,
        );

        // MHDR(1) + body(12) + MIC(4) = 17
        assert_eq!(frame.len(), 17);
        assert_eq!(frame[0], 0x20);

        let plain = decrypt_join_accept(&APP_KEY, &frame).unwrap();
        assert_eq!(&plain[0..3], &[0x02, 0x01, 0x00]); // JoinNonce
        assert_eq!(&plain[3..6], &[0x13, 0x00, 0x00]); // NetID
        assert_eq!(&plain[6..10], &0x01AB5678u32.to_le_bytes()); // DevAddr
        assert_eq!(plain[10], 0x00); // DLSettings, OptNeg clear
        assert_eq!(plain[11], 1); // RxDelay

        let expected_mic = mic(&APP_KEY, &[&[0x20], &plain[..12]]);
        assert_eq!(&plain[12..16], &expected_mic);
    }

    #[test]
    fn test_build_current_join_accept_with_cf_list() {
        let root = RootKeySet {
            nwk_key: NWK_KEY,
            app_key: Some(APP_KEY),
        };
        let join_eui = Eui64::from_u64(0x0102030405060708);
        let dev_eui = Eui64::from_u64(0x0807060504030201);

        let mut b = builder();
        b.cf_list = Some([0xCF; 16]);
        let frame = b.build(KeyScheme::Current, &root, join_eui, dev_eui, 9);

        // MHDR(1) + body(28) + MIC(4) = 33
        assert_eq!(frame.len(), 33);

        // 1.1 Join-Accepts are encrypted under NwkKey
        let plain = decrypt_join_accept(&NWK_KEY, &frame).unwrap();
        assert_eq!(plain[10] & OPT_NEG, OPT_NEG);
        assert_eq!(&plain[12..28], &[0xCF; 16]);

        let int_key = js_int_key(&NWK_KEY, dev_eui);
        let expected_mic = mic(
            &int_key,
            &[
                &[0xFF],
                &join_eui.to_le_bytes(),
                &9u16.to_le_bytes(),
                &[0x20],
                &plain[..28],
            ],
        );
        assert_eq!(&plain[28..32], &expected_mic);
    }

    #[test]
    fn test_decrypt_rejects_other_frames() {
        assert!(decrypt_join_accept(&NWK_KEY, &[]).is_none());
        assert!(decrypt_join_accept(&NWK_KEY, &[0x40; 17]).is_none());
        assert!(decrypt_join_accept(&NWK_KEY, &[0x20; 10]).is_none());
    }
}
