//! Network Server Simulator
//!
//! Plays a roaming network server: sends signed JoinReqs to the join
//! server's datagram listener, then unwraps the returned session keys and
//! decrypts the Join-Accept the way the device would.
//!
//! Usage: cargo run --bin ns-sim -- --dev-nonce 1 --count 3

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

use lora_join_server::interop::answer::open_session_keys;
use lora_join_server::interop::messages::{
    decode_join_ans, encode_join_req, JoinReq, MessageType,
};
use lora_join_server::lorawan::encoder::decrypt_join_accept;
use lora_join_server::lorawan::keys::{AesKey, SessionKeys};
use lora_join_server::lorawan::{DevAddr, Eui64, JoinRequestFrame, KeyScheme, MacVersion, NetId};

#[derive(Parser)]
#[command(name = "ns-sim")]
#[command(about = "Send roaming JoinReqs to a LoRaWAN join server")]
struct Cli {
    /// Join server listener address
    #[arg(long, default_value = "127.0.0.1:4700")]
    server: SocketAddr,

    /// Local address; must match the peer `addr` in the join server config
    #[arg(long, default_value = "127.0.0.1:4701")]
    bind: SocketAddr,

    #[arg(long, default_value = "000013")]
    net_id: NetId,

    #[arg(long, default_value = "70B3D57ED0000001")]
    join_eui: Eui64,

    #[arg(long, default_value = "0004A30B001C0530")]
    dev_eui: Eui64,

    #[arg(long, default_value = "2B7E151628AED2A6ABF7158809CF4F3C")]
    nwk_key: AesKey,

    /// AppKey of the device; used as the 1.0.x root key when given
    #[arg(long)]
    app_key: Option<AesKey>,

    /// KEK shared with the join server
    #[arg(long, default_value = "000102030405060708090A0B0C0D0E0F")]
    kek: AesKey,

    #[arg(long, default_value = "1.1")]
    mac_version: MacVersion,

    /// DevNonce of the first request; later requests increment it
    #[arg(long, default_value_t = 1)]
    dev_nonce: u16,

    /// Number of JoinReqs to send
    #[arg(long, default_value_t = 1)]
    count: u16,

    /// Resend the last request to exercise replay protection
    #[arg(long)]
    replay: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    println!("📡 LoRaWAN Network Server Simulator");
    println!("  Join server: {}", cli.server);
    println!("  NetID: {}  JoinEUI: {}  DevEUI: {}", cli.net_id, cli.join_eui, cli.dev_eui);
    println!("  MAC version: {}", cli.mac_version);
    println!();

    let socket = UdpSocket::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;

    let mut nonces: Vec<u16> = (0..cli.count)
        .map(|i| cli.dev_nonce.wrapping_add(i))
        .collect();
    if cli.replay {
        if let Some(&last) = nonces.last() {
            nonces.push(last);
        }
    }

    for (i, dev_nonce) in nonces.into_iter().enumerate() {
        let req = build_join_req(&cli, dev_nonce, i as u32 + 1);
        println!("➡️  JoinReq #{} (DevNonce {})", req.transaction_id, dev_nonce);

        socket.send_to(&encode_join_req(&req)?, cli.server).await?;

        let mut buf = vec![0u8; 4096];
        match timeout(Duration::from_secs(3), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => report(&cli, &buf[..len])?,
            Ok(Err(e)) => println!("   ❌ Recv error: {}", e),
            Err(_) => println!("   ⏰ No JoinAns (timeout)"),
        }
        println!();

        sleep(Duration::from_millis(200)).await;
    }

    println!("✨ Simulation complete!");
    Ok(())
}

fn root_key(cli: &Cli) -> &AesKey {
    match cli.mac_version.scheme() {
        KeyScheme::Legacy => cli.app_key.as_ref().unwrap_or(&cli.nwk_key),
        KeyScheme::Current => &cli.nwk_key,
    }
}

fn build_join_req(cli: &Cli, dev_nonce: u16, transaction_id: u32) -> JoinReq {
    let frame = JoinRequestFrame::signed(cli.join_eui, cli.dev_eui, dev_nonce, root_key(cli));

    JoinReq {
        protocol_version: "1.1".to_string(),
        sender_id: cli.net_id,
        receiver_id: cli.join_eui,
        transaction_id,
        message_type: MessageType::JoinReq,
        mac_version: cli.mac_version.to_string(),
        phy_payload: frame.encode().into(),
        dev_eui: cli.dev_eui,
        dev_addr: DevAddr::new(0x2601_1F00 | u32::from(dev_nonce & 0xFF)),
        dl_settings: vec![0x00].into(),
        rx_delay: 1,
        cf_list: None,
    }
}

fn report(cli: &Cli, datagram: &[u8]) -> anyhow::Result<()> {
    let ans = decode_join_ans(datagram)?;

    if !ans.is_success() {
        println!(
            "   ⚠️  {:?}: {}",
            ans.result.result_code, ans.result.description
        );
        return Ok(());
    }

    println!(
        "   ✅ Success, SessionKeyID {}",
        ans.session_key_id.as_deref().unwrap_or("-")
    );
    if let Some(lifetime) = ans.lifetime {
        println!("   Lifetime: {}s", lifetime);
    }

    match open_session_keys(&ans, &cli.kek)? {
        SessionKeys::Legacy {
            nwk_s_key,
            app_s_key,
        } => {
            println!("   NwkSKey:     {}", nwk_s_key);
            println!("   AppSKey:     {}", app_s_key);
        }
        SessionKeys::Split {
            f_nwk_s_int_key,
            s_nwk_s_int_key,
            nwk_s_enc_key,
            app_s_key,
        } => {
            println!("   FNwkSIntKey: {}", f_nwk_s_int_key);
            println!("   SNwkSIntKey: {}", s_nwk_s_int_key);
            println!("   NwkSEncKey:  {}", nwk_s_enc_key);
            println!("   AppSKey:     {}", app_s_key);
        }
    }

    if let Some(phy) = &ans.phy_payload {
        match decrypt_join_accept(root_key(cli), phy.as_slice()) {
            Some(body) => {
                let join_nonce = u32::from_le_bytes([body[0], body[1], body[2], 0]);
                println!(
                    "   Join-Accept: JoinNonce {} ({} bytes)",
                    join_nonce,
                    phy.len()
                );
            }
            None => println!("   ⚠️  Join-Accept did not decrypt"),
        }
    }

    Ok(())
}
