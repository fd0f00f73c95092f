//! ND proxy scenarios: admission gates, advertisement shape, board-backed
//! verification and advertise-MAC resolution.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use fletsv6_companion::board::{RouterBoard, ZERO_MAC};
use fletsv6_companion::config::{MacRef, NdConfig, NdMode};
use fletsv6_companion::nd::{AdvertiseMac, admit, parse_ns};
use fletsv6_companion::packet::{
    Icmpv6Data, NdOption, NdPayload, OPT_TARGET_LINK_ADDR, neighbor_advertisement,
    neighbor_solicitation,
};
use fletsv6_companion::store::{RouterInfo, RouterInfoStore};
use fletsv6_companion::test_util::{BoardCall, MockBoard};

const REQUESTER_MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
const ADVERTISE_MAC: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

fn nd_config(prefixes: &[&str], excludes: &[&str]) -> NdConfig {
    NdConfig {
        mode: NdMode::ProxyRos { strict: false },
        prefixes: prefixes.iter().map(|p| p.parse().unwrap()).collect(),
        excludes: excludes.iter().map(|e| e.parse().unwrap()).collect(),
        external_interfaces: vec!["eth0".into()],
        internal_interfaces: Vec::new(),
        timeout: Duration::from_millis(1000),
        advertise_macs: vec![MacRef::Literal(ADVERTISE_MAC)],
    }
}

fn learned_store() -> RouterInfoStore {
    let store = RouterInfoStore::new();
    store.publish(RouterInfo {
        prefix: "2001:db8:1::/64".parse().unwrap(),
        gateway: "fe80::1".parse().unwrap(),
    });
    store
}

#[test]
fn solicitations_outside_every_prefix_are_dropped() {
    let cfg = nd_config(&["ra-prefix"], &[]);
    let store = learned_store();

    let inside = parse_ns(&neighbor_solicitation(
        "fe80::99".parse().unwrap(),
        REQUESTER_MAC,
        "2001:db8:1::abcd".parse().unwrap(),
    ))
    .unwrap();
    assert!(admit(&inside.target, &cfg, &store));

    let outside = parse_ns(&neighbor_solicitation(
        "fe80::99".parse().unwrap(),
        REQUESTER_MAC,
        "2001:db8:ffff::abcd".parse().unwrap(),
    ))
    .unwrap();
    assert!(!admit(&outside.target, &cfg, &store));
}

#[test]
fn excluded_targets_produce_no_advertisement() {
    // NDP_EXCLUDE_IPS=ra-prefix::1/128 suppresses the router's own address.
    let cfg = nd_config(&["ra-prefix"], &["ra-prefix::1/128"]);
    let store = learned_store();

    assert!(!admit(&"2001:db8:1::1".parse().unwrap(), &cfg, &store));
    assert!(admit(&"2001:db8:1::abcd".parse().unwrap(), &cfg, &store));
}

#[test]
fn advertisement_answers_the_solicitation() {
    // NS from aa:bb:cc:dd:ee:ff / fe80::99 for 2001:db8:1::abcd, answered
    // with the advertise MAC as both source and target link-layer address.
    let requester: Ipv6Addr = "fe80::99".parse().unwrap();
    let target: Ipv6Addr = "2001:db8:1::abcd".parse().unwrap();

    let ns = parse_ns(&neighbor_solicitation(requester, REQUESTER_MAC, target)).unwrap();
    let frame = neighbor_advertisement(ADVERTISE_MAC, ns.src_mac, ns.src_ip, ns.target);
    let na = Icmpv6Data::decode(&frame).unwrap();

    assert_eq!(na.src_mac, ADVERTISE_MAC);
    assert_eq!(na.dst_mac, REQUESTER_MAC);
    assert_eq!(na.src_ip, target);
    assert_eq!(na.dst_ip, requester);
    let NdPayload::NeighborAdvert {
        flags,
        target: advertised,
        options,
    } = na.payload
    else {
        panic!("not a neighbor advertisement");
    };
    assert_eq!(flags, 0x40);
    assert_eq!(advertised, target);
    assert_eq!(
        options,
        vec![NdOption::link_addr(OPT_TARGET_LINK_ADDR, ADVERTISE_MAC)]
    );
}

#[test]
fn board_lookup_strictness_controls_the_sentinel() {
    let board = MockBoard::new();
    let target: Ipv6Addr = "2001:db8:1::abcd".parse().unwrap();

    // Echo succeeds but the neighbor table is empty: non-strict yields the
    // zero-MAC sentinel, strict yields nothing.
    board.set_echo_ok(true);
    assert_eq!(board.lookup_neighbor(target, 1000, false).unwrap(), Some(ZERO_MAC));
    assert_eq!(board.lookup_neighbor(target, 1000, true).unwrap(), None);

    // A table hit wins in both modes.
    board.set_neighbor(Some([1, 2, 3, 4, 5, 6]));
    assert_eq!(
        board.lookup_neighbor(target, 1000, true).unwrap(),
        Some([1, 2, 3, 4, 5, 6])
    );

    let recorded = board.calls();
    assert_eq!(
        recorded[0],
        BoardCall::LookupNeighbor {
            addr: target,
            timeout_ms: 1000,
            strict: false,
        }
    );
}

#[test]
fn symbolic_advertise_mac_caches_the_last_answer() {
    let board: Arc<dyn RouterBoard> = {
        let mock = MockBoard::new();
        mock.set_interface_mac("ether1", ADVERTISE_MAC);
        Arc::new(mock)
    };
    let adv = AdvertiseMac::new(MacRef::Interface("ether1".into()));
    assert_eq!(adv.resolve(Some(&board)), Some(ADVERTISE_MAC));
}

#[test]
fn symbolic_advertise_mac_falls_back_to_the_previous_value() {
    let mock = Arc::new(MockBoard::new());
    mock.set_interface_mac("ether1", ADVERTISE_MAC);
    let board: Arc<dyn RouterBoard> = mock.clone();

    let adv = AdvertiseMac::new(MacRef::Interface("ether1".into()));
    assert_eq!(adv.resolve(Some(&board)), Some(ADVERTISE_MAC));

    // The board stops answering; the cached value keeps advertisements
    // flowing.
    mock.set_fail_interface_mac(true);
    assert_eq!(adv.resolve(Some(&board)), Some(ADVERTISE_MAC));
}
