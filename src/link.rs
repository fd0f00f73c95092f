//! Interface name resolution and VLAN sub-link management.
//!
//! An external interface is named `eth0` or `eth0@101`; the latter means
//! 802.1Q VLAN 101 on eth0, carried by a sub-link named `eth0.vlan101`
//! that is created on demand. A pre-existing sub-link must be a VLAN link
//! with the declared id attached to the declared base, otherwise the name
//! does not resolve.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use futures::TryStreamExt;
use netlink_packet_route::link::{InfoData, InfoKind, InfoVlan, LinkAttribute, LinkInfo, LinkMessage};
use rtnetlink::Handle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A declared interface name, possibly VLAN-tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceName {
    pub base: String,
    pub vlan: Option<u16>,
}

impl FromStr for InterfaceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('@');
        let base = parts.next().unwrap_or_default();
        let vlan = parts.next();
        if base.is_empty() || parts.next().is_some() {
            return Err(Error::Config(format!("malformed interface name '{s}'")));
        }
        let vlan = match vlan {
            None => None,
            Some(v) => Some(
                v.parse::<u16>()
                    .ok()
                    .filter(|id| (1..=4094).contains(id))
                    .ok_or_else(|| Error::Config(format!("malformed interface name '{s}'")))?,
            ),
        };
        Ok(InterfaceName {
            base: base.to_string(),
            vlan,
        })
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vlan {
            Some(id) => write!(f, "{}@{id}", self.base),
            None => f.write_str(&self.base),
        }
    }
}

impl InterfaceName {
    /// The kernel link name this resolves to.
    pub fn actual_name(&self) -> String {
        match self.vlan {
            Some(id) => format!("{}.vlan{id}", self.base),
            None => self.base.clone(),
        }
    }

    /// Resolve to a link index, creating the VLAN sub-link if needed.
    pub fn resolve(&self) -> Result<u32> {
        let actual = self.actual_name();
        if let Some(id) = self.vlan {
            ensure_vlan(&self.base, &actual, id)?;
        }
        nix::net::if_::if_nametoindex(actual.as_str())
            .map_err(|e| Error::Link(actual.clone(), e.to_string()))
    }
}

/// An interface that resolved to a kernel link, remembering its position in
/// the configured list (advertise MACs align positionally).
#[derive(Debug, Clone)]
pub struct ResolvedLink {
    pub position: usize,
    pub name: InterfaceName,
    pub index: u32,
}

/// Resolve the first usable interface out of a candidate list.
pub fn find_first(names: &[String]) -> Result<(InterfaceName, u32)> {
    for name in names {
        let decoded: InterfaceName = match name.parse() {
            Ok(d) => d,
            Err(_) => {
                warn!(name, "Ignoring malformed interface name");
                continue;
            }
        };
        match decoded.resolve() {
            Ok(index) => return Ok((decoded, index)),
            Err(e) => {
                debug!(name, error = %e, "Interface did not resolve");
            }
        }
    }
    Err(Error::Link(
        names.join(","),
        "could not resolve any of these interfaces".into(),
    ))
}

/// Resolve every usable interface out of a list, skipping failures.
pub fn collect(names: &[String]) -> Result<Vec<ResolvedLink>> {
    let mut resolved = Vec::new();
    for (position, name) in names.iter().enumerate() {
        let decoded: InterfaceName = match name.parse() {
            Ok(d) => d,
            Err(_) => {
                warn!(name, "Ignoring malformed interface name");
                continue;
            }
        };
        match decoded.resolve() {
            Ok(index) => resolved.push(ResolvedLink {
                position,
                name: decoded,
                index,
            }),
            Err(e) => {
                warn!(name, error = %e, "Failed to resolve interface");
            }
        }
    }
    if resolved.is_empty() {
        return Err(Error::Link(
            names.join(","),
            "could not resolve any of these interfaces".into(),
        ));
    }
    Ok(resolved)
}

/// First fe80::/10 unicast address assigned to a link.
pub fn link_local(ifname: &str) -> Option<Ipv6Addr> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!(ifname, error = %e, "getifaddrs failed");
            return None;
        }
    };
    for ifaddr in addrs {
        if ifaddr.interface_name != ifname {
            continue;
        }
        if let Some(storage) = ifaddr.address
            && let Some(sin6) = storage.as_sockaddr_in6()
        {
            let ip = sin6.ip();
            if ip.segments()[0] & 0xffc0 == 0xfe80 {
                return Some(ip);
            }
        }
    }
    None
}

/// Hardware address of a link.
pub fn hardware_addr(ifname: &str) -> Option<[u8; 6]> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != ifname {
            continue;
        }
        if let Some(storage) = ifaddr.address
            && let Some(link) = storage.as_link_addr()
            && let Some(addr) = link.addr()
        {
            return Some(addr);
        }
    }
    None
}

fn netlink_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .map_err(|e| Error::Netlink(e.to_string()))
}

/// Make sure `devname` exists as VLAN `vlan_id` on top of `base`.
fn ensure_vlan(base: &str, devname: &str, vlan_id: u16) -> Result<()> {
    let rt = netlink_runtime()?;
    rt.block_on(async {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| Error::Netlink(e.to_string()))?;
        tokio::spawn(connection);

        match get_link(&handle, devname).await? {
            Some(link) => check_vlan(&handle, base, devname, vlan_id, &link).await,
            None => create_vlan(&handle, base, devname, vlan_id).await,
        }
    })
}

async fn get_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
        Err(e) => Err(Error::Netlink(e.to_string())),
    }
}

/// Validate that an existing link is the VLAN sub-link we declared.
async fn check_vlan(
    handle: &Handle,
    base: &str,
    devname: &str,
    vlan_id: u16,
    link: &LinkMessage,
) -> Result<()> {
    let mut kind_ok = false;
    let mut id_ok = false;
    let mut parent = None;
    for attr in &link.attributes {
        match attr {
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(InfoKind::Vlan) => kind_ok = true,
                        LinkInfo::Data(InfoData::Vlan(vlan)) => {
                            id_ok = vlan.iter().any(|i| matches!(i, InfoVlan::Id(id) if *id == vlan_id));
                        }
                        _ => {}
                    }
                }
            }
            LinkAttribute::Link(index) => parent = Some(*index),
            _ => {}
        }
    }

    let base_link = get_link(handle, base)
        .await?
        .ok_or_else(|| Error::Link(base.to_string(), "no such link".into()))?;
    if !kind_ok || !id_ok || parent != Some(base_link.header.index) {
        return Err(Error::Link(
            devname.to_string(),
            format!("not a vlan {vlan_id} device for {base}"),
        ));
    }
    Ok(())
}

async fn create_vlan(handle: &Handle, base: &str, devname: &str, vlan_id: u16) -> Result<()> {
    let base_link = get_link(handle, base)
        .await?
        .ok_or_else(|| Error::Link(base.to_string(), "no such link".into()))?;

    match handle
        .link()
        .add()
        .vlan(devname.to_string(), base_link.header.index, vlan_id)
        .execute()
        .await
    {
        Ok(()) => info!(devname, base, vlan_id, "Created VLAN sub-link"),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
            debug!(devname, "VLAN sub-link already exists");
        }
        Err(e) => return Err(Error::Netlink(e.to_string())),
    }

    let created = get_link(handle, devname)
        .await?
        .ok_or_else(|| Error::Link(devname.to_string(), "vanished after creation".into()))?;
    handle
        .link()
        .set(created.header.index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::Netlink(e.to_string()))
}
