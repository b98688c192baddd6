//! Downlink frame construction: unicast/multicast fcntdown
//! bookkeeping, MAC-payload assembly, and MIC signing.

use crate::codec::reverse;
use crate::crypto::{self, DIR_DOWN};
use crate::error::EngineError;
use crate::store::records::DevAddr;
use crate::store::Store;
use crate::warnings::{WarnKind, WarnScope, WarnSink};

/// Application-layer payload request for a downlink frame.
#[derive(Debug, Clone, Default)]
pub struct TxData {
    pub fport: Option<u8>,
    pub data: Vec<u8>,
    pub confirmed: bool,
    pub fpending: bool,
}

/// A wire-ready downlink frame, already signed.
pub type DownlinkFrame = Vec<u8>;

/// Emits a unicast downlink to `devaddr`, transactionally incrementing
/// `node.fcntdown`. `fopts` are inline MAC commands (cleartext on the wire
/// unless `fport == Some(0)`, in which case they ride inside the encrypted
/// payload instead).
pub async fn encode_unicast(
    store: &dyn Store,
    warn: &dyn WarnSink,
    devaddr: DevAddr,
    adr: bool,
    ack: bool,
    fopts: &[u8],
    txdata: TxData,
) -> Result<DownlinkFrame, EngineError> {
    let tx = store.lock_node(devaddr).await;
    let mut node = tx.node().cloned().ok_or(EngineError::UnknownDevAddr)?;
    let fcnt = node.fcntdown;
    node.fcntdown = node.fcntdown.wrapping_add(1);
    let nwkskey = node.nwkskey;

    let frame = encode_frame(
        warn,
        devaddr,
        &node.nwkskey,
        &node.appskey,
        adr,
        ack,
        fopts,
        fcnt,
        &txdata,
    );

    tx.commit(Some(node));
    Ok(sign_frame(&nwkskey, devaddr, fcnt, &frame, txdata.confirmed))
}

/// Emits a multicast downlink: ADR and ACK are always clear and no FOpts
/// are carried.
pub async fn encode_multicast(
    store: &dyn Store,
    warn: &dyn WarnSink,
    devaddr: DevAddr,
    txdata: TxData,
) -> Result<DownlinkFrame, EngineError> {
    let mut channel = store
        .get_multicast(devaddr)
        .await?
        .ok_or(EngineError::UnknownDevAddr)?;
    let fcnt = channel.fcntdown;
    channel.fcntdown = channel.fcntdown.wrapping_add(1);

    let frame = encode_frame(
        warn,
        devaddr,
        &channel.nwkskey,
        &channel.appskey,
        false,
        false,
        &[],
        fcnt,
        &txdata,
    );
    let signed = sign_frame(&channel.nwkskey, devaddr, fcnt, &frame, txdata.confirmed);

    store.put_multicast(channel).await?;
    Ok(signed)
}

fn encode_frame(
    warn: &dyn WarnSink,
    devaddr: DevAddr,
    nwkskey: &[u8; 16],
    appskey: &[u8; 16],
    adr: bool,
    ack: bool,
    fopts: &[u8],
    fcnt: u32,
    txdata: &TxData,
) -> Vec<u8> {
    let fctrl = (adr as u8) << 7 | (ack as u8) << 5 | (txdata.fpending as u8) << 4 | (fopts.len() as u8 & 0x0F);
    let mut fhdr = Vec::with_capacity(7 + fopts.len());
    fhdr.extend_from_slice(&reverse(&devaddr));
    fhdr.push(fctrl);
    fhdr.extend_from_slice(&(fcnt as u16).to_le_bytes());
    fhdr.extend_from_slice(fopts);

    match txdata.fport {
        Some(0) => {
            if !txdata.data.is_empty() {
                warn.emit(WarnScope::Node(devaddr), WarnKind::DroppedPort0Data);
            }
            let mut out = fhdr;
            out.push(0);
            out.extend(crypto::cipher(fopts, nwkskey, DIR_DOWN, devaddr, fcnt));
            out
        }
        Some(port) => {
            let mut out = fhdr;
            out.push(port);
            out.extend(crypto::cipher(&txdata.data, appskey, DIR_DOWN, devaddr, fcnt));
            out
        }
        None => fhdr,
    }
}

/// Prepends the MHDR and appends the 4-byte MIC.
fn sign_frame(nwkskey: &[u8; 16], devaddr: DevAddr, fcnt: u32, macpayload: &[u8], confirmed: bool) -> Vec<u8> {
    let mhdr: u8 = if confirmed { 0b101_00_000 } else { 0b011_00_000 };
    let mut msg = Vec::with_capacity(1 + macpayload.len());
    msg.push(mhdr);
    msg.extend_from_slice(macpayload);
    let mic = crypto::compute_mic(nwkskey, DIR_DOWN, devaddr, fcnt, &msg);
    msg.extend_from_slice(&mic);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{default_adr, default_rxwin, Region};
    use crate::store::memory::MemoryStore;
    use crate::store::records::{Node, ProfileId};
    use crate::warnings::TracingWarnSink;

    fn sample_node(devaddr: DevAddr) -> Node {
        Node {
            devaddr,
            profile: ProfileId(1),
            nwkskey: [0x2b; 16],
            appskey: [0x3c; 16],
            fcntup: Some(0),
            fcntdown: 0,
            adr_use: default_adr(Region::Eu868),
            rxwin_use: default_rxwin(Region::Eu868),
            first_reset: None,
            last_reset: None,
            reset_count: 0,
            last_rx: None,
            last_gateways: vec![],
            devstat: vec![],
            devstat_fcnt: None,
            last_qs: vec![],
            adr_flag: false,
            adr_set: None,
            adr_failed: 0,
            rxwin_failed: 0,
            appargs: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn unicast_ack_only_frame_carries_no_payload() {
        let store = MemoryStore::new();
        let devaddr = [1, 2, 3, 4];
        store.seed_node(sample_node(devaddr)).await;
        let warn = TracingWarnSink;

        let frame = encode_unicast(&store, &warn, devaddr, false, true, &[], TxData::default())
            .await
            .unwrap();

        // MHDR + reversed devaddr(4) + fctrl(1) + fcnt(2) + mic(4), no fport/payload.
        assert_eq!(frame.len(), 1 + 4 + 1 + 2 + 4);
        assert_eq!(frame[0], 0b011_00_000);
    }

    #[tokio::test]
    async fn unicast_increments_fcntdown_each_call() {
        let store = MemoryStore::new();
        let devaddr = [1, 2, 3, 4];
        store.seed_node(sample_node(devaddr)).await;
        let warn = TracingWarnSink;

        encode_unicast(&store, &warn, devaddr, false, false, &[], TxData::default())
            .await
            .unwrap();
        let tx = store.lock_node(devaddr).await;
        assert_eq!(tx.node().unwrap().fcntdown, 1);
    }
}
