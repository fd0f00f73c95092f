//! Reconciliation scenarios: the RS → RA → board flow and change-driven
//! re-reconciliation, exercised against a recording mock board.

use std::sync::Arc;

use fletsv6_companion::config::{RaConfig, RaMode, parse_ip_assign, parse_pool_assign};
use fletsv6_companion::ra::{parse_ra, reconcile};
use fletsv6_companion::store::{RouterInfo, RouterInfoStore};
use fletsv6_companion::test_util::{BoardCall, MockBoard};
use fletsv6_companion::packet::{Icmpv6Data, NdOption, NdPayload, OPT_PREFIX_INFO};

use std::net::Ipv6Addr;
use std::time::Duration;

fn ros_config() -> RaConfig {
    let external_if = "ether1";
    RaConfig {
        mode: RaMode::Ros,
        external_interfaces: vec!["eth1".into()],
        timeout: Duration::from_millis(5000),
        ros_external_interface: external_if.into(),
        external_ips: vec![
            parse_ip_assign("ra-prefix::1/64@@external:advertise", external_if).unwrap(),
        ],
        internal_ips: vec![parse_ip_assign("ra-prefix::2/64@bridge1:eui-64", external_if).unwrap()],
        pools: vec![parse_pool_assign("ra-prefix@fletsv6-pool/64").unwrap()],
    }
}

/// Build a Router Advertisement frame carrying a prefix-information option.
fn ra_frame(gateway: Ipv6Addr, prefix: Ipv6Addr, prefix_len: u8) -> Vec<u8> {
    let mut data = vec![0u8; 30];
    data[0] = prefix_len;
    data[14..30].copy_from_slice(&prefix.octets());
    Icmpv6Data {
        src_mac: [0x02, 0, 0, 0, 0, 0x01],
        dst_mac: [0x33, 0x33, 0, 0, 0, 1],
        src_ip: gateway,
        dst_ip: "ff02::1".parse().unwrap(),
        payload: NdPayload::RouterAdvert {
            cur_hop_limit: 64,
            flags: 0,
            router_lifetime: 1800,
            reachable_time: 0,
            retrans_time: 0,
            options: vec![NdOption {
                kind: OPT_PREFIX_INFO,
                data,
            }],
        },
    }
    .encode()
}

#[test]
fn advertisement_drives_board_reconciliation() {
    let cfg = ros_config();
    let store = RouterInfoStore::new();
    let board = Arc::new(MockBoard::new());

    // The upstream router advertises 2001:db8:1::/64 from fe80::1.
    let frame = ra_frame("fe80::1".parse().unwrap(), "2001:db8:1::".parse().unwrap(), 64);
    let observed = parse_ra(&frame).unwrap();
    store.publish(RouterInfo {
        prefix: observed.prefix.unwrap(),
        gateway: observed.gateway,
    });

    reconcile(&cfg, &store, board.as_ref());

    let calls = board.calls();
    assert_eq!(
        calls[0],
        BoardCall::SetDefaultGateway {
            ifname: "ether1".into(),
            gateway: "fe80::1".parse().unwrap(),
        }
    );
    // External assignment resolves against the learned prefix, keyed by its
    // own template spelling, on the expanded @external interface.
    let BoardCall::AssignAddress {
        ifname,
        address,
        key,
        options,
    } = &calls[1]
    else {
        panic!("expected an address assignment, got {:?}", calls[1]);
    };
    assert_eq!(ifname, "ether1");
    assert_eq!(*address, "2001:db8:1::1/64".parse().unwrap());
    assert_eq!(key, "ra-prefix::1/64");
    assert!(options.advertise);
    assert!(!options.eui64);

    let BoardCall::AssignAddress { ifname, address, options, .. } = &calls[2] else {
        panic!("expected an address assignment, got {:?}", calls[2]);
    };
    assert_eq!(ifname, "bridge1");
    assert_eq!(*address, "2001:db8:1::2/64".parse().unwrap());
    assert!(options.eui64);

    assert_eq!(
        calls[3],
        BoardCall::DeclarePool {
            name: "fletsv6-pool".into(),
            prefix: "2001:db8:1::/64".parse().unwrap(),
            sub_prefix_len: 64,
        }
    );
    assert_eq!(calls.len(), 4);
}

#[test]
fn changed_advertisement_reconciles_the_new_state() {
    let cfg = ros_config();
    let store = RouterInfoStore::new();
    let board = Arc::new(MockBoard::new());

    store.publish(RouterInfo {
        prefix: "2001:db8:1::/64".parse().unwrap(),
        gateway: "fe80::1".parse().unwrap(),
    });
    reconcile(&cfg, &store, board.as_ref());
    board.clear_calls();

    // A second RA moves the delegation.
    let observed = parse_ra(&ra_frame(
        "fe80::2".parse().unwrap(),
        "2001:db8:2::".parse().unwrap(),
        64,
    ))
    .unwrap();
    store.publish(RouterInfo {
        prefix: observed.prefix.unwrap(),
        gateway: observed.gateway,
    });
    reconcile(&cfg, &store, board.as_ref());

    let calls = board.calls();
    assert_eq!(
        calls[0],
        BoardCall::SetDefaultGateway {
            ifname: "ether1".into(),
            gateway: "fe80::2".parse().unwrap(),
        }
    );
    let BoardCall::AssignAddress { address, .. } = &calls[1] else {
        panic!("expected an address assignment, got {:?}", calls[1]);
    };
    assert_eq!(*address, "2001:db8:2::1/64".parse().unwrap());
    assert_eq!(
        calls[3],
        BoardCall::DeclarePool {
            name: "fletsv6-pool".into(),
            prefix: "2001:db8:2::/64".parse().unwrap(),
            sub_prefix_len: 64,
        }
    );
}

#[test]
fn reconcile_without_router_info_touches_nothing() {
    let cfg = ros_config();
    let store = RouterInfoStore::new();
    let board = Arc::new(MockBoard::new());

    reconcile(&cfg, &store, board.as_ref());
    assert!(board.calls().is_empty());
}
