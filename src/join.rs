//! DevAddr allocation and join-accept emission.

use chrono::Utc;
use rand::Rng;

use crate::codec::reverse;
use crate::crypto::{self, encrypt_join_accept};
use crate::error::EngineError;
use crate::region;
use crate::store::records::{DevAddr, Device, Network, Node, Profile};
use crate::store::Store;
use crate::warnings::{WarnKind, WarnScope, WarnSink};

/// Parameters the join-accept's DLSettings/RxDelay fields carry. Regional
/// channel plans are out of scope; these are caller-supplied or
/// default to the network's region.
#[derive(Debug, Clone, Copy)]
pub struct JoinAcceptParams {
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
    pub rx_delay: u8,
}

impl JoinAcceptParams {
    pub fn default_for(network: &Network) -> Self {
        let rxwin = region::default_rxwin(network.region);
        JoinAcceptParams {
            rx1_dr_offset: rxwin.rx1_dr_offset,
            rx2_dr: rxwin.rx2_dr,
            rx_delay: 1,
        }
    }
}

/// Allocates a DevAddr for `device` under `network`. Reuses the
/// device's last-assigned address if it has one; otherwise tries up to 3
/// random candidates before surfacing `DevAddrExhausted` — the source this
/// engine is modeled on falls through to a crash here instead, which is not
/// acceptable behavior for a server.
pub async fn allocate_devaddr(
    store: &dyn Store,
    device: &Device,
    network: &Network,
) -> Result<DevAddr, EngineError> {
    if let Some(existing) = device.node {
        return Ok(existing);
    }

    let known = store.known_devaddrs().await?;
    let mut rng = rand::thread_rng();
    let nwk_id = network.nwk_id();

    for _ in 0..3 {
        let candidate = compose_devaddr(nwk_id, network.subid, &mut rng);
        if !known.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(EngineError::DevAddrExhausted)
}

fn compose_devaddr(nwk_id: u8, subid: Option<(u32, u8)>, rng: &mut impl Rng) -> DevAddr {
    let mut addr: u32 = (nwk_id as u32 & 0x7F) << 25;
    let sub_len = subid.map(|(_, len)| len).unwrap_or(0);
    if let Some((value, len)) = subid {
        let masked = value & ((1u32 << len) - 1);
        addr |= masked << (25 - len);
    }
    let rand_len = 25 - sub_len;
    let rand_val: u32 = rng.gen_range(0..(1u32 << rand_len));
    addr |= rand_val;
    addr.to_be_bytes()
}

/// Outcome of a successful join: the wire-ready join-accept frame plus the
/// session the caller should hand to its application layer.
pub struct AcceptResult {
    pub frame: Vec<u8>,
    pub devaddr: DevAddr,
    pub nwkskey: [u8; 16],
    pub appskey: [u8; 16],
}

/// Validates a join-request's MIC and looks up the device, but performs no
/// writes — state only changes in [`handle_accept`].
pub fn verify_join_request(
    appkey: &[u8; 16],
    msg: &[u8],
    mic: [u8; 4],
) -> Result<(), EngineError> {
    let tag = crypto::aes_cmac(appkey, msg);
    if tag[0..4] != mic {
        return Err(EngineError::BadMic);
    }
    Ok(())
}

/// Builds and encrypts the join-accept frame, and atomically writes the
/// `device` and `node` rows in one transaction. `gateways` is
/// opaque metadata the caller wants attached to the new session.
pub async fn handle_accept(
    store: &dyn Store,
    warn: &dyn WarnSink,
    network: &Network,
    profile: &Profile,
    device: &Device,
    devaddr: DevAddr,
    dev_nonce: [u8; 2],
    params: JoinAcceptParams,
    gateways: Vec<String>,
) -> Result<AcceptResult, EngineError> {
    let mut rng = rand::thread_rng();
    let app_nonce: [u8; 3] = [rng.gen(), rng.gen(), rng.gen()];

    let nwkskey = crypto::derive_session_key(&device.appkey, 0x01, app_nonce, network.netid, dev_nonce);
    let appskey = crypto::derive_session_key(&device.appkey, 0x02, app_nonce, network.netid, dev_nonce);

    let tx = store.lock_join(device.deveui, devaddr).await;
    let prior_node = tx.node().cloned();

    let now = Utc::now();
    let (reset_count, first_reset) = match &prior_node {
        Some(n) if n.last_rx.is_none() => {
            warn.emit(WarnScope::Node(devaddr), WarnKind::RepeatedReset);
            (n.reset_count + 1, n.first_reset)
        }
        _ => (0, Some(now)),
    };

    let new_node = Node {
        devaddr,
        profile: profile.id,
        nwkskey,
        appskey,
        fcntup: None,
        fcntdown: 0,
        adr_use: region::default_adr(network.region),
        rxwin_use: region::default_rxwin(network.region),
        first_reset,
        last_reset: Some(now),
        reset_count,
        last_rx: None,
        last_gateways: gateways,
        devstat: prior_node.as_ref().map(|n| n.devstat.clone()).unwrap_or_default(),
        devstat_fcnt: None,
        last_qs: prior_node.as_ref().map(|n| n.last_qs.clone()).unwrap_or_default(),
        adr_flag: false,
        adr_set: None,
        adr_failed: 0,
        rxwin_failed: 0,
        appargs: device.appargs.clone(),
    };

    let new_device = Device {
        deveui: device.deveui,
        appeui: device.appeui,
        appkey: device.appkey,
        profile: device.profile,
        node: Some(devaddr),
        appargs: device.appargs.clone(),
        last_join: Some(now),
    };

    tx.commit(new_device, new_node);
    store.purge_pending(devaddr).await?;
    warn.emit(WarnScope::Node(devaddr), WarnKind::Join);

    let mut macpayload = Vec::with_capacity(12);
    macpayload.extend_from_slice(&app_nonce);
    macpayload.extend_from_slice(&network.netid);
    macpayload.extend_from_slice(&reverse(&devaddr));
    let dl_settings = (params.rx1_dr_offset & 0x07) << 4 | (params.rx2_dr & 0x0F);
    macpayload.push(dl_settings);
    macpayload.push(params.rx_delay);

    const MHDR_JOIN_ACCEPT: u8 = 0b001_00_0_00;
    let mut signed = Vec::with_capacity(1 + macpayload.len());
    signed.push(MHDR_JOIN_ACCEPT);
    signed.extend_from_slice(&macpayload);
    let mic_tag = crypto::aes_cmac(&device.appkey, &signed);
    let mic = [mic_tag[0], mic_tag[1], mic_tag[2], mic_tag[3]];

    let mut to_encrypt = macpayload;
    to_encrypt.extend_from_slice(&mic);
    let ciphertext = encrypt_join_accept(&device.appkey, &to_encrypt);

    let mut frame = Vec::with_capacity(1 + ciphertext.len());
    frame.push(MHDR_JOIN_ACCEPT);
    frame.extend_from_slice(&ciphertext);

    Ok(AcceptResult {
        frame,
        devaddr,
        nwkskey,
        appskey,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use crate::store::memory::MemoryStore;
    use crate::store::records::{FcntCheck, NetworkId, ProfileId};
    use crate::warnings::TracingWarnSink;

    fn sample_network(id: u32, nwk_id: u8, subid: Option<(u32, u8)>) -> Network {
        Network {
            id: NetworkId(id),
            name: "test-network".into(),
            netid: [nwk_id & 0x7F, 0, 0],
            subid,
            region: Region::Eu868,
        }
    }

    fn sample_profile(id: u32, network: u32) -> Profile {
        Profile {
            id: ProfileId(id),
            network: NetworkId(network),
            can_join: true,
            fcnt_check: FcntCheck::Strict16,
        }
    }

    fn sample_device(deveui: [u8; 8], profile: u32) -> Device {
        Device {
            deveui,
            appeui: None,
            appkey: [0u8; 16],
            profile: ProfileId(profile),
            node: None,
            appargs: serde_json::Value::Null,
            last_join: None,
        }
    }

    #[tokio::test]
    async fn devaddr_allocation_reuses_existing_assignment() {
        let store = MemoryStore::new();
        let network = sample_network(1, 1, None);
        let mut device = sample_device([1; 8], 1);
        device.node = Some([9, 9, 9, 9]);

        let devaddr = allocate_devaddr(&store, &device, &network).await.unwrap();
        assert_eq!(devaddr, [9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn devaddr_allocation_exhausts_after_three_collisions() {
        // SubID consumes all 25 non-NwkID bits, so `compose_devaddr` has
        // zero bits of randomness left and always proposes the same
        // candidate deterministically.
        let store = MemoryStore::new();
        let network = sample_network(1, 0x01, Some((0, 25)));
        let device = sample_device([2; 8], 1);

        let forced_candidate = compose_devaddr(network.nwk_id(), network.subid, &mut rand::thread_rng());
        store
            .seed_node(crate::store::records::Node {
                devaddr: forced_candidate,
                profile: ProfileId(1),
                nwkskey: [0u8; 16],
                appskey: [0u8; 16],
                fcntup: None,
                fcntdown: 0,
                adr_use: region::default_adr(Region::Eu868),
                rxwin_use: region::default_rxwin(Region::Eu868),
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
            })
            .await;

        let result = allocate_devaddr(&store, &device, &network).await;
        assert_eq!(result, Err(EngineError::DevAddrExhausted));
    }

    #[tokio::test]
    async fn handle_accept_join_accept_round_trips_p1() {
        let store = MemoryStore::new();
        let warn = TracingWarnSink;
        let network = sample_network(1, 1, None);
        let profile = sample_profile(1, 1);
        let mut device = sample_device([3; 8], 1);
        device.appkey = [0x00; 16];
        let devaddr = [0x01, 0x02, 0x03, 0x04];
        let dev_nonce = [0xAB, 0xCD];
        let params = JoinAcceptParams::default_for(&network);

        let result = handle_accept(
            &store,
            &warn,
            &network,
            &profile,
            &device,
            devaddr,
            dev_nonce,
            params,
            vec!["gw-1".into()],
        )
        .await
        .unwrap();

        // frame = MHDR || ciphertext; decrypting the reciprocal way (plain
        // AES-ECB encrypt of the padded ciphertext) reproduces the signed
        // plaintext.
        assert_eq!(result.frame[0], 0b001_00_000);
        let ciphertext = &result.frame[1..];
        let recovered = crypto::decrypt_join_accept(&device.appkey, ciphertext);
        let (macpayload, mic) = recovered.split_at(recovered.len() - 4);

        let mut signed = vec![result.frame[0]];
        signed.extend_from_slice(macpayload);
        let expected_mic = crypto::aes_cmac(&device.appkey, &signed);
        assert_eq!(&expected_mic[0..4], mic);

        // AppNonce(3) || NetID(3) || DevAddr(4, LE) || DLSettings(1) || RxDelay(1)
        assert_eq!(&macpayload[3..6], &network.netid);
        assert_eq!(&macpayload[6..10], &reverse(&devaddr)[..]);

        // Node/device state committed inside the same transaction.
        let tx = store.lock_node(devaddr).await;
        let node = tx.node().unwrap();
        assert_eq!(node.fcntup, None);
        assert_eq!(node.fcntdown, 0);
        assert_eq!(node.nwkskey, result.nwkskey);
        assert_eq!(node.appskey, result.appskey);
        assert_ne!(node.nwkskey, node.appskey);
    }

    #[tokio::test]
    async fn handle_accept_increments_reset_count_on_repeated_reset() {
        let store = MemoryStore::new();
        let warn = TracingWarnSink;
        let network = sample_network(1, 1, None);
        let profile = sample_profile(1, 1);
        let device = sample_device([4; 8], 1);
        let devaddr = [0x01, 0x02, 0x03, 0x04];
        let params = JoinAcceptParams::default_for(&network);

        // First join: no prior node, so reset_count starts at 0.
        handle_accept(&store, &warn, &network, &profile, &device, devaddr, [1, 1], params, vec![])
            .await
            .unwrap();

        // The device never transmitted (`last_rx` stays `None`), so a second
        // join before any uplink is a repeated reset.
        handle_accept(&store, &warn, &network, &profile, &device, devaddr, [2, 2], params, vec![])
            .await
            .unwrap();

        let tx = store.lock_node(devaddr).await;
        assert_eq!(tx.node().unwrap().reset_count, 1);
    }
}
