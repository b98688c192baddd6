//! Semtech UDP Packet Forwarder (GWMP) transport: the thin demonstration
//! layer that turns gateway datagrams into [`crate::ingest::ingest_frame`]
//! calls and turns queued downlinks into PULL_RESP datagrams. Gateway
//! transport is explicitly out of scope for the engine itself; this module
//! exists only so the demo binary has something to drive the engine with.

pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ingest::{self, GatewayContext, Outcome};
use crate::store::records::QualitySample;
use crate::store::Store;
use crate::warnings::WarnSink;
use protocol::{GwmpPacket, PullRespPayload, PushDataPayload, Rxpk, Txpk};

/// Tracks the most recently seen gateway address (learned from PULL_DATA
/// keepalives), so downlinks know where to send PULL_RESP.
#[derive(Debug, Clone)]
pub struct GatewayTracker {
    inner: Arc<RwLock<Option<SocketAddr>>>,
}

impl GatewayTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set(&self, addr: SocketAddr) {
        let mut guard = self.inner.write().await;
        let changed = *guard != Some(addr);
        *guard = Some(addr);
        if changed {
            info!("gateway address updated: {}", addr);
        }
    }

    pub async fn get(&self) -> Option<SocketAddr> {
        *self.inner.read().await
    }
}

impl Default for GatewayTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle the outbound side uses to push a PULL_RESP downlink to
/// whichever gateway last sent a PULL_DATA keepalive.
#[derive(Clone)]
pub struct DownlinkSender {
    socket: Arc<UdpSocket>,
    gateway: GatewayTracker,
}

impl DownlinkSender {
    pub async fn send_downlink(&self, txpk: &Txpk) -> anyhow::Result<()> {
        let gw_addr = self
            .gateway
            .get()
            .await
            .ok_or_else(|| anyhow::anyhow!("no gateway address known (no PULL_DATA received yet)"))?;

        let payload = PullRespPayload { txpk: txpk.clone() };
        let json = serde_json::to_string(&payload)?;
        let token: u16 = rand_token();
        let packet = GwmpPacket::pull_resp(token, &json);

        self.socket.send_to(&packet, gw_addr).await?;
        info!(
            "sent PULL_RESP to gateway {} (token=0x{:04x}, {} bytes)",
            gw_addr,
            token,
            json.len()
        );
        Ok(())
    }
}

fn rand_token() -> u16 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (seed & 0xFFFF) as u16
}

/// Starts the UDP server as a background task and returns a handle for
/// sending downlinks. `store`/`warn`/`max_lost_after_reset` are threaded
/// straight into `ingest_frame` for every accepted PUSH_DATA rxpk.
pub async fn start_server(
    config: &Config,
    store: Arc<dyn Store>,
    warn: Arc<dyn WarnSink>,
) -> anyhow::Result<DownlinkSender> {
    let socket = Arc::new(UdpSocket::bind(&config.udp.bind).await?);
    info!("UDP server listening on {}", config.udp.bind);

    let gateway = GatewayTracker::new();
    let downlink_sender = DownlinkSender {
        socket: socket.clone(),
        gateway: gateway.clone(),
    };

    let max_lost_after_reset = config.engine.max_lost_after_reset;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    debug!("received {} bytes from {}", len, src);
                    match GwmpPacket::parse(&buf[..len]) {
                        Ok(packet) => {
                            handle_packet(&socket, src, packet, &*store, &*warn, max_lost_after_reset, &gateway).await;
                        }
                        Err(e) => warn!("failed to parse GWMP packet from {}: {}", src, e),
                    }
                }
                Err(e) => error!("UDP recv error: {}", e),
            }
        }
    });

    Ok(downlink_sender)
}

async fn handle_packet(
    socket: &UdpSocket,
    src: SocketAddr,
    packet: GwmpPacket,
    store: &dyn Store,
    warn: &dyn WarnSink,
    max_lost_after_reset: u32,
    gateway: &GatewayTracker,
) {
    match packet {
        GwmpPacket::PushData {
            random_token,
            gateway_eui,
            json_payload,
        } => {
            let gw_eui_hex = hex::encode(gateway_eui);
            info!("PUSH_DATA from gateway {} (token: 0x{:04x})", gw_eui_hex, random_token);

            let ack = GwmpPacket::push_ack(random_token);
            if let Err(e) = socket.send_to(&ack, src).await {
                error!("failed to send PUSH_ACK to {}: {}", src, e);
            }

            match serde_json::from_str::<PushDataPayload>(&json_payload) {
                Ok(payload) => {
                    if let Some(rxpks) = payload.rxpk {
                        for rxpk in rxpks {
                            handle_rxpk(store, warn, max_lost_after_reset, &rxpk, &gw_eui_hex).await;
                        }
                    }
                    if let Some(stat) = payload.stat {
                        debug!("gateway status: {}", stat);
                    }
                }
                Err(e) => warn!("failed to parse PUSH_DATA JSON: {}", e),
            }
        }
        GwmpPacket::PullData { random_token, gateway_eui } => {
            let gw_eui_hex = hex::encode(gateway_eui);
            debug!("PULL_DATA from gateway {} (token: 0x{:04x})", gw_eui_hex, random_token);
            gateway.set(src).await;
            let ack = GwmpPacket::pull_ack(random_token);
            if let Err(e) = socket.send_to(&ack, src).await {
                error!("failed to send PULL_ACK to {}: {}", src, e);
            }
        }
        GwmpPacket::TxAck { random_token, gateway_eui, json_payload } => {
            let gw_eui_hex = hex::encode(gateway_eui);
            match json_payload.as_deref().and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok()) {
                Some(parsed) => {
                    let error = parsed.get("txpk_ack").and_then(|a| a.get("error")).and_then(|e| e.as_str());
                    match error {
                        None | Some("NONE") => info!("TX_ACK from {} (token 0x{:04x}): ok", gw_eui_hex, random_token),
                        Some(err) => warn!("TX_ACK from {} (token 0x{:04x}): {}", gw_eui_hex, random_token, err),
                    }
                }
                None => info!("TX_ACK from {} (token 0x{:04x}): ok", gw_eui_hex, random_token),
            }
        }
        GwmpPacket::PushAck { random_token } => debug!("PUSH_ACK (token 0x{:04x})", random_token),
        GwmpPacket::PullAck { random_token } => debug!("PULL_ACK (token 0x{:04x})", random_token),
    }
}

async fn handle_rxpk(
    store: &dyn Store,
    warn: &dyn WarnSink,
    max_lost_after_reset: u32,
    rxpk: &Rxpk,
    gateway_eui: &str,
) {
    let phy_payload = match base64_decode(&rxpk.data) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to base64 decode rxpk data: {}", e);
            return;
        }
    };

    let ctx = GatewayContext {
        gateway_id: Some(gateway_eui.to_string()),
        quality: Some(QualitySample {
            rssi: rxpk.rssi as i32,
            snr: rxpk.lsnr.unwrap_or(0.0) as f32,
        }),
    };

    match ingest::ingest_frame(store, warn, max_lost_after_reset, &phy_payload, ctx).await {
        Ok(Outcome::Uplink(frame)) => {
            info!(
                "uplink devaddr={:08X?} fcnt={} fport={:?} {} bytes",
                frame.devaddr,
                frame.fcnt,
                frame.fport,
                frame.data.len()
            );
        }
        Ok(Outcome::Retransmit(frame)) => {
            debug!("retransmit devaddr={:08X?} fcnt={}", frame.devaddr, frame.fcnt);
        }
        Ok(Outcome::Join { deveui, .. }) => {
            info!("join-request from deveui={}", hex::encode(deveui));
        }
        Ok(Outcome::Ignore) => {
            debug!("ignored frame from {}", gateway_eui);
        }
        Err(e) => {
            warn!("ingest_frame failed: {}", e);
        }
    }
}

fn base64_decode(input: &str) -> anyhow::Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .map_err(|e| anyhow::anyhow!("base64 decode error: {}", e))
}

/// Builds a Txpk for an immediate (Class C) US915 downlink transmission.
pub fn build_txpk(payload_b64: &str, payload_size: u16) -> Txpk {
    Txpk {
        imme: Some(true),
        tmst: None,
        freq: 923.3,
        rfch: Some(0),
        powe: Some(27),
        modu: Some("LORA".to_string()),
        datr: "SF12BW500".to_string(),
        codr: Some("4/5".to_string()),
        ipol: Some(true),
        size: payload_size,
        data: payload_b64.to_string(),
        ncrc: Some(true),
    }
}
