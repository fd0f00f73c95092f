//! ICMPv6 frame construction and parsing.
//!
//! Handles the four Neighbor Discovery messages the companion speaks:
//! RS (133), RA (134), NS (135), NA (136). Frames are fixed-layout
//! Ethernet / IPv6 / ICMPv6 with the checksum computed over the IPv6
//! pseudo-header; no extension headers.

use std::net::Ipv6Addr;

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv6Address,
    Ipv6Packet,
};

use crate::error::{Error, Result};

/// Ethernet header size.
const ETHERNET_HEADER_SIZE: usize = 14;

/// IPv6 header size.
const IPV6_HEADER_SIZE: usize = 40;

/// All-routers multicast group and its derived Ethernet address.
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);
pub const ALL_ROUTERS_MAC: [u8; 6] = [0x33, 0x33, 0x00, 0x00, 0x00, 0x02];

/// ND option types (RFC 4861).
pub const OPT_SOURCE_LINK_ADDR: u8 = 1;
pub const OPT_TARGET_LINK_ADDR: u8 = 2;
pub const OPT_PREFIX_INFO: u8 = 3;

/// Neighbor Advertisement flag bits.
pub const NA_FLAG_SOLICITED: u8 = 0x40;

/// A raw ND option. `data` excludes the type and length bytes and includes
/// any zero padding up to the 8-byte option boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdOption {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl NdOption {
    pub fn link_addr(kind: u8, mac: [u8; 6]) -> Self {
        NdOption {
            kind,
            data: mac.to_vec(),
        }
    }

    fn encoded_len(&self) -> usize {
        (2 + self.data.len()).div_ceil(8) * 8
    }
}

/// The ICMPv6 message body, tagged by message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdPayload {
    RouterSolicit {
        options: Vec<NdOption>,
    },
    RouterAdvert {
        cur_hop_limit: u8,
        flags: u8,
        router_lifetime: u16,
        reachable_time: u32,
        retrans_time: u32,
        options: Vec<NdOption>,
    },
    NeighborSolicit {
        target: Ipv6Addr,
        options: Vec<NdOption>,
    },
    NeighborAdvert {
        flags: u8,
        target: Ipv6Addr,
        options: Vec<NdOption>,
    },
}

impl NdPayload {
    pub fn msg_type(&self) -> u8 {
        match self {
            NdPayload::RouterSolicit { .. } => 133,
            NdPayload::RouterAdvert { .. } => 134,
            NdPayload::NeighborSolicit { .. } => 135,
            NdPayload::NeighborAdvert { .. } => 136,
        }
    }

    pub fn options(&self) -> &[NdOption] {
        match self {
            NdPayload::RouterSolicit { options }
            | NdPayload::RouterAdvert { options, .. }
            | NdPayload::NeighborSolicit { options, .. }
            | NdPayload::NeighborAdvert { options, .. } => options,
        }
    }

    /// Length of the body after the 4-byte ICMPv6 header.
    fn body_len(&self) -> usize {
        let opts: usize = self.options().iter().map(NdOption::encoded_len).sum();
        match self {
            NdPayload::RouterSolicit { .. } => 4 + opts,
            NdPayload::RouterAdvert { .. } => 12 + opts,
            NdPayload::NeighborSolicit { .. } => 20 + opts,
            NdPayload::NeighborAdvert { .. } => 20 + opts,
        }
    }

    fn emit(&self, buf: &mut [u8]) {
        let opts_at = match *self {
            NdPayload::RouterSolicit { .. } => 4,
            NdPayload::RouterAdvert {
                cur_hop_limit,
                flags,
                router_lifetime,
                reachable_time,
                retrans_time,
                ..
            } => {
                buf[0] = cur_hop_limit;
                buf[1] = flags;
                buf[2..4].copy_from_slice(&router_lifetime.to_be_bytes());
                buf[4..8].copy_from_slice(&reachable_time.to_be_bytes());
                buf[8..12].copy_from_slice(&retrans_time.to_be_bytes());
                12
            }
            NdPayload::NeighborSolicit { target, .. } => {
                buf[4..20].copy_from_slice(&target.octets());
                20
            }
            NdPayload::NeighborAdvert { flags, target, .. } => {
                buf[0] = flags;
                buf[4..20].copy_from_slice(&target.octets());
                20
            }
        };

        let mut at = opts_at;
        for opt in self.options() {
            let len = opt.encoded_len();
            buf[at] = opt.kind;
            buf[at + 1] = (len / 8) as u8;
            buf[at + 2..at + 2 + opt.data.len()].copy_from_slice(&opt.data);
            at += len;
        }
    }

    fn parse(msg_type: u8, body: &[u8]) -> Result<Self> {
        let fixed = match msg_type {
            133 => 4,
            134 => 12,
            135 | 136 => 20,
            other => {
                return Err(Error::MalformedFrame(format!(
                    "unexpected ICMPv6 type {other}"
                )));
            }
        };
        if body.len() < fixed {
            return Err(Error::MalformedFrame(format!(
                "truncated ICMPv6 type {msg_type} body ({} bytes)",
                body.len()
            )));
        }
        let options = parse_options(&body[fixed..])?;

        Ok(match msg_type {
            133 => NdPayload::RouterSolicit { options },
            134 => NdPayload::RouterAdvert {
                cur_hop_limit: body[0],
                flags: body[1],
                router_lifetime: u16::from_be_bytes([body[2], body[3]]),
                reachable_time: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                retrans_time: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
                options,
            },
            135 => NdPayload::NeighborSolicit {
                target: target_addr(body),
                options,
            },
            _ => NdPayload::NeighborAdvert {
                flags: body[0],
                target: target_addr(body),
                options,
            },
        })
    }
}

fn target_addr(body: &[u8]) -> Ipv6Addr {
    let octets: [u8; 16] = body[4..20].try_into().unwrap();
    Ipv6Addr::from(octets)
}

fn parse_options(mut rest: &[u8]) -> Result<Vec<NdOption>> {
    let mut options = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 2 || rest[1] == 0 {
            return Err(Error::MalformedFrame("bad ND option header".into()));
        }
        let total = usize::from(rest[1]) * 8;
        if rest.len() < total {
            return Err(Error::MalformedFrame("truncated ND option".into()));
        }
        options.push(NdOption {
            kind: rest[0],
            data: rest[2..total].to_vec(),
        });
        rest = &rest[total..];
    }
    Ok(options)
}

/// A decoded or to-be-encoded ND frame: link and network addresses plus the
/// tagged message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icmpv6Data {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv6Addr,
    pub dst_ip: Ipv6Addr,
    pub payload: NdPayload,
}

impl Icmpv6Data {
    /// Build the complete Ethernet frame with lengths and checksum filled.
    pub fn encode(&self) -> Vec<u8> {
        let icmp_len = 4 + self.payload.body_len();
        let mut buf = vec![0u8; ETHERNET_HEADER_SIZE + IPV6_HEADER_SIZE + icmp_len];

        let eth_repr = EthernetRepr {
            src_addr: EthernetAddress::from_bytes(&self.src_mac),
            dst_addr: EthernetAddress::from_bytes(&self.dst_mac),
            ethertype: EthernetProtocol::Ipv6,
        };
        let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
        eth_repr.emit(&mut frame);

        let mut ip = Ipv6Packet::new_unchecked(frame.payload_mut());
        ip.set_version(6);
        ip.set_traffic_class(0xb8);
        ip.set_flow_label(0);
        ip.set_payload_len(icmp_len as u16);
        ip.set_next_header(IpProtocol::Icmpv6);
        ip.set_hop_limit(255);
        ip.set_src_addr(Ipv6Address::from_bytes(&self.src_ip.octets()));
        ip.set_dst_addr(Ipv6Address::from_bytes(&self.dst_ip.octets()));

        let icmp = ip.payload_mut();
        icmp[0] = self.payload.msg_type();
        icmp[1] = 0;
        self.payload.emit(&mut icmp[4..]);
        let sum = checksum(&self.src_ip, &self.dst_ip, icmp);
        icmp[2..4].copy_from_slice(&sum.to_be_bytes());

        buf
    }

    /// Parse an Ethernet / IPv6 / ICMPv6 frame into its addresses and body.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let eth = EthernetFrame::new_checked(frame)
            .map_err(|e| Error::MalformedFrame(format!("ethernet: {e}")))?;
        if eth.ethertype() != EthernetProtocol::Ipv6 {
            return Err(Error::MalformedFrame(format!(
                "not IPv6 (ethertype {})",
                eth.ethertype()
            )));
        }

        let ip = Ipv6Packet::new_checked(eth.payload())
            .map_err(|e| Error::MalformedFrame(format!("ipv6: {e}")))?;
        if ip.next_header() != IpProtocol::Icmpv6 {
            return Err(Error::MalformedFrame(format!(
                "not ICMPv6 (next header {})",
                ip.next_header()
            )));
        }

        let icmp = ip.payload();
        if icmp.len() < 4 {
            return Err(Error::MalformedFrame("truncated ICMPv6 header".into()));
        }

        Ok(Icmpv6Data {
            src_mac: eth.src_addr().0,
            dst_mac: eth.dst_addr().0,
            src_ip: Ipv6Addr::from(ip.src_addr().0),
            dst_ip: Ipv6Addr::from(ip.dst_addr().0),
            payload: NdPayload::parse(icmp[0], &icmp[4..])?,
        })
    }
}

/// ICMPv6 checksum over the IPv6 pseudo-header and the message bytes.
pub fn checksum(src: &Ipv6Addr, dst: &Ipv6Addr, icmp: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    // Pseudo-header
    for chunk in src.octets().chunks(2) {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    for chunk in dst.octets().chunks(2) {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    sum += icmp.len() as u32;
    sum += 58; // next header

    // Message bytes
    let mut i = 0;
    while i + 1 < icmp.len() {
        sum += u32::from(u16::from_be_bytes([icmp[i], icmp[i + 1]]));
        i += 2;
    }
    if i < icmp.len() {
        sum += u32::from(icmp[i]) << 8;
    }

    // Fold to 16 bits
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    let result = !(sum as u16);
    if result == 0 { 0xffff } else { result }
}

/// Solicited-node multicast address of `target` and its Ethernet mapping
/// (RFC 4291: ff02::1:ff + low 24 bits; MAC 33:33 + low 32 bits).
pub fn solicited_node(target: &Ipv6Addr) -> (Ipv6Addr, [u8; 6]) {
    let t = target.octets();
    let ip = Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, t[13], t[14], t[15],
    ]);
    let mac = [0x33, 0x33, 0xff, t[13], t[14], t[15]];
    (ip, mac)
}

/// Router Solicitation to all-routers, carrying our link-layer address.
pub fn router_solicitation(src_ip: Ipv6Addr, src_mac: [u8; 6]) -> Vec<u8> {
    Icmpv6Data {
        src_mac,
        dst_mac: ALL_ROUTERS_MAC,
        src_ip,
        dst_ip: ALL_ROUTERS,
        payload: NdPayload::RouterSolicit {
            options: vec![NdOption::link_addr(OPT_SOURCE_LINK_ADDR, src_mac)],
        },
    }
    .encode()
}

/// Neighbor Solicitation for `target`, sent to its solicited-node group.
pub fn neighbor_solicitation(src_ip: Ipv6Addr, src_mac: [u8; 6], target: Ipv6Addr) -> Vec<u8> {
    let (dst_ip, dst_mac) = solicited_node(&target);
    Icmpv6Data {
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        payload: NdPayload::NeighborSolicit {
            target,
            options: vec![NdOption::link_addr(OPT_SOURCE_LINK_ADDR, src_mac)],
        },
    }
    .encode()
}

/// Solicited Neighbor Advertisement answering an NS for `target`, sourced
/// from the target address itself.
pub fn neighbor_advertisement(
    advertise_mac: [u8; 6],
    dst_mac: [u8; 6],
    dst_ip: Ipv6Addr,
    target: Ipv6Addr,
) -> Vec<u8> {
    Icmpv6Data {
        src_mac: advertise_mac,
        dst_mac,
        src_ip: target,
        dst_ip,
        payload: NdPayload::NeighborAdvert {
            flags: NA_FLAG_SOLICITED,
            target,
            options: vec![NdOption::link_addr(OPT_TARGET_LINK_ADDR, advertise_mac)],
        },
    }
    .encode()
}

/// Extract the prefix-information option of a Router Advertisement:
/// prefix length at data byte 0, prefix at data bytes 14..30.
pub fn prefix_information(options: &[NdOption]) -> Option<(Ipv6Addr, u8)> {
    options
        .iter()
        .find(|o| o.kind == OPT_PREFIX_INFO && o.data.len() >= 30)
        .map(|o| {
            let octets: [u8; 16] = o.data[14..30].try_into().unwrap();
            (Ipv6Addr::from(octets), o.data[0])
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
    const DST_MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    /// One's-complement sum over pseudo-header and message, checksum field
    /// included. A correctly checksummed message folds to 0xffff.
    fn fold_with_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, icmp: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        for chunk in src.octets().chunks(2) {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        for chunk in dst.octets().chunks(2) {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        sum += icmp.len() as u32 + 58;
        let mut i = 0;
        while i + 1 < icmp.len() {
            sum += u32::from(u16::from_be_bytes([icmp[i], icmp[i + 1]]));
            i += 2;
        }
        if i < icmp.len() {
            sum += u32::from(icmp[i]) << 8;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    fn prefix_info_option(prefix: Ipv6Addr, len: u8) -> NdOption {
        let mut data = vec![0u8; 30];
        data[0] = len;
        data[1] = 0xc0;
        data[14..30].copy_from_slice(&prefix.octets());
        NdOption {
            kind: OPT_PREFIX_INFO,
            data,
        }
    }

    #[test]
    fn router_solicitation_roundtrip() {
        let src: Ipv6Addr = "fe80::1:2".parse().unwrap();
        let frame = router_solicitation(src, SRC_MAC);

        let decoded = Icmpv6Data::decode(&frame).unwrap();
        assert_eq!(decoded.src_mac, SRC_MAC);
        assert_eq!(decoded.dst_mac, ALL_ROUTERS_MAC);
        assert_eq!(decoded.src_ip, src);
        assert_eq!(decoded.dst_ip, ALL_ROUTERS);
        assert_eq!(decoded.payload.msg_type(), 133);
        assert_eq!(
            decoded.payload.options(),
            &[NdOption::link_addr(OPT_SOURCE_LINK_ADDR, SRC_MAC)]
        );

        // Re-encoding the decoded data reproduces the frame byte for byte.
        assert_eq!(decoded.encode(), frame);
    }

    #[test]
    fn neighbor_solicitation_targets_solicited_node_group() {
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let target: Ipv6Addr = "2001:db8:1::abcd".parse().unwrap();
        let frame = neighbor_solicitation(src, SRC_MAC, target);

        let decoded = Icmpv6Data::decode(&frame).unwrap();
        assert_eq!(decoded.dst_ip, "ff02::1:ff00:abcd".parse::<Ipv6Addr>().unwrap());
        assert_eq!(decoded.dst_mac, [0x33, 0x33, 0xff, 0x00, 0xab, 0xcd]);
        match decoded.payload {
            NdPayload::NeighborSolicit { target: t, .. } => assert_eq!(t, target),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn neighbor_advertisement_shape() {
        let requester: Ipv6Addr = "fe80::99".parse().unwrap();
        let target: Ipv6Addr = "2001:db8:1::abcd".parse().unwrap();
        let frame = neighbor_advertisement(SRC_MAC, DST_MAC, requester, target);

        let decoded = Icmpv6Data::decode(&frame).unwrap();
        assert_eq!(decoded.src_mac, SRC_MAC);
        assert_eq!(decoded.dst_mac, DST_MAC);
        assert_eq!(decoded.src_ip, target);
        assert_eq!(decoded.dst_ip, requester);
        match decoded.payload {
            NdPayload::NeighborAdvert { flags, target: t, ref options } => {
                assert_eq!(flags, NA_FLAG_SOLICITED);
                assert_eq!(t, target);
                assert_eq!(options, &[NdOption::link_addr(OPT_TARGET_LINK_ADDR, SRC_MAC)]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn router_advertisement_roundtrip_and_prefix() {
        let gateway: Ipv6Addr = "fe80::1".parse().unwrap();
        let prefix: Ipv6Addr = "2001:db8:1::".parse().unwrap();
        let data = Icmpv6Data {
            src_mac: SRC_MAC,
            dst_mac: [0x33, 0x33, 0, 0, 0, 1],
            src_ip: gateway,
            dst_ip: "ff02::1".parse().unwrap(),
            payload: NdPayload::RouterAdvert {
                cur_hop_limit: 64,
                flags: 0,
                router_lifetime: 1800,
                reachable_time: 0,
                retrans_time: 0,
                options: vec![
                    NdOption::link_addr(OPT_SOURCE_LINK_ADDR, SRC_MAC),
                    prefix_info_option(prefix, 64),
                ],
            },
        };
        let frame = data.encode();

        let decoded = Icmpv6Data::decode(&frame).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.encode(), frame);
        assert_eq!(
            prefix_information(decoded.payload.options()),
            Some((prefix, 64))
        );
    }

    #[test]
    fn emitted_checksum_verifies_to_zero() {
        let src: Ipv6Addr = "fe80::1:2".parse().unwrap();
        let target: Ipv6Addr = "2001:db8::42".parse().unwrap();
        for frame in [
            router_solicitation(src, SRC_MAC),
            neighbor_solicitation(src, SRC_MAC, target),
            neighbor_advertisement(SRC_MAC, DST_MAC, src, target),
        ] {
            let ip = Ipv6Packet::new_checked(&frame[ETHERNET_HEADER_SIZE..]).unwrap();
            let s = Ipv6Addr::from(ip.src_addr().0);
            let d = Ipv6Addr::from(ip.dst_addr().0);
            assert_eq!(fold_with_checksum(&s, &d, ip.payload()), 0xffff);
        }
    }

    #[test]
    fn ipv6_header_fields() {
        let frame = router_solicitation("fe80::1".parse().unwrap(), SRC_MAC);
        let ip = Ipv6Packet::new_checked(&frame[ETHERNET_HEADER_SIZE..]).unwrap();
        assert_eq!(ip.version(), 6);
        assert_eq!(ip.traffic_class(), 0xb8);
        assert_eq!(ip.flow_label(), 0);
        assert_eq!(ip.hop_limit(), 255);
        assert_eq!(ip.next_header(), IpProtocol::Icmpv6);
    }

    #[test]
    fn decode_rejects_junk() {
        assert!(Icmpv6Data::decode(&[0u8; 10]).is_err());

        // IPv4 ethertype
        let mut not_v6 = vec![0u8; 60];
        not_v6[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        assert!(Icmpv6Data::decode(&not_v6).is_err());

        // Truncated option in an otherwise valid NS
        let mut frame =
            neighbor_solicitation("fe80::1".parse().unwrap(), SRC_MAC, "2001:db8::1".parse().unwrap());
        let len = frame.len();
        frame.truncate(len - 4);
        // Fix up the IPv6 payload length so only the option is short.
        let plen = (len - 4 - ETHERNET_HEADER_SIZE - IPV6_HEADER_SIZE) as u16;
        frame[18..20].copy_from_slice(&plen.to_be_bytes());
        assert!(Icmpv6Data::decode(&frame).is_err());
    }
}
