//! Environment-driven configuration for the RA and ND workers.
//!
//! All knobs come from environment variables; parsing failures are fatal at
//! startup. The FlexibleIP grammar is
//! `ra-prefix` | `ra-prefix::SUFFIX[/CIDR]` | `RAW-IPv6[/CIDR]`.

use std::env;
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::time::Duration;

use ipnet::Ipv6Net;
use tracing::debug;

use crate::board::AssignOptions;
use crate::error::{Error, Result};

/// A templated IPv6 address. When `ra_prefix` is set the high bits come
/// from the learned RA prefix at resolution time; a bare `ra-prefix`
/// additionally inherits the learned prefix length (`addr`/`cidr` empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlexibleIP {
    pub ra_prefix: bool,
    pub addr: Option<Ipv6Addr>,
    pub cidr: Option<u8>,
}

impl FlexibleIP {
    pub fn bare_ra_prefix() -> Self {
        FlexibleIP {
            ra_prefix: true,
            addr: None,
            cidr: None,
        }
    }
}

fn parse_addr_cidr(s: &str) -> Result<(Ipv6Addr, u8)> {
    if s.contains('/') {
        let net = s
            .parse::<Ipv6Net>()
            .map_err(|_| Error::Config(format!("invalid IPv6 prefix '{s}'")))?;
        Ok((net.addr(), net.prefix_len()))
    } else {
        let addr = s
            .parse::<Ipv6Addr>()
            .map_err(|_| Error::Config(format!("invalid IPv6 address '{s}'")))?;
        Ok((addr, 128))
    }
}

impl FromStr for FlexibleIP {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("ra-prefix") {
            if rest.is_empty() {
                return Ok(FlexibleIP::bare_ra_prefix());
            }
            let (addr, cidr) = parse_addr_cidr(rest)?;
            return Ok(FlexibleIP {
                ra_prefix: true,
                addr: Some(addr),
                cidr: Some(cidr),
            });
        }
        let (addr, cidr) = parse_addr_cidr(s)?;
        Ok(FlexibleIP {
            ra_prefix: false,
            addr: Some(addr),
            cidr: Some(cidr),
        })
    }
}

impl fmt::Display for FlexibleIP {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ra_prefix {
            f.write_str("ra-prefix")?;
        }
        if let Some(addr) = self.addr {
            write!(f, "{addr}")?;
        }
        if let Some(cidr) = self.cidr {
            write!(f, "/{cidr}")?;
        }
        Ok(())
    }
}

/// One `FLEXIBLEIP@IFNAME[:option]*` address assignment for the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAssign {
    pub ip: FlexibleIP,
    pub ifname: String,
    pub options: AssignOptions,
}

/// One `FLEXIBLEIP@POOLNAME/PFXLEN` pool assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAssign {
    pub ip: FlexibleIP,
    pub name: String,
    pub prefix_len: u8,
}

/// Advertise-MAC reference: a literal address, or "the current hardware
/// address of board interface X" resolved lazily at advertise time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacRef {
    Literal([u8; 6]),
    Interface(String),
}

impl fmt::Display for MacRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacRef::Literal(mac) => f.write_str(&format_mac(mac)),
            MacRef::Interface(name) => write!(f, "@{name}"),
        }
    }
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse a colon-separated MAC address.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::Config(format!("invalid MAC address '{s}'")));
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)
            .map_err(|_| Error::Config(format!("invalid MAC address '{s}'")))?;
    }
    Ok(mac)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaMode {
    Ros,
    Off,
}

#[derive(Debug, Clone)]
pub struct RaConfig {
    pub mode: RaMode,
    pub external_interfaces: Vec<String>,
    pub timeout: Duration,
    pub ros_external_interface: String,
    pub external_ips: Vec<IpAssign>,
    pub internal_ips: Vec<IpAssign>,
    pub pools: Vec<PoolAssign>,
}

impl RaConfig {
    pub fn disabled() -> Self {
        RaConfig {
            mode: RaMode::Off,
            external_interfaces: Vec::new(),
            timeout: Duration::from_millis(5000),
            ros_external_interface: String::new(),
            external_ips: Vec::new(),
            internal_ips: Vec::new(),
            pools: Vec::new(),
        }
    }

    pub fn dump(&self) {
        debug!("Router Advertisement configuration:");
        debug!("  RA_MODE={:?}", self.mode);
        if !self.external_interfaces.is_empty() {
            debug!("  RA_EXTERNAL_INTERFACES={:?}", self.external_interfaces);
        }
        debug!("  RA_TIMEOUT={}ms", self.timeout.as_millis());
        if !self.ros_external_interface.is_empty() {
            debug!(
                "  RA_ROS_EXTERNAL_INTERFACE={}",
                self.ros_external_interface
            );
        }
        for (i, assign) in self.external_ips.iter().enumerate() {
            debug!("  external ip {i}: {}@{}", assign.ip, assign.ifname);
        }
        for (i, assign) in self.internal_ips.iter().enumerate() {
            debug!("  internal ip {i}: {}@{}", assign.ip, assign.ifname);
        }
        for (i, pool) in self.pools.iter().enumerate() {
            debug!(
                "  pool {i}: {}@{}/{}",
                pool.ip, pool.name, pool.prefix_len
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdMode {
    Off,
    Static,
    Proxy,
    ProxyRos { strict: bool },
}

impl FromStr for NdMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(NdMode::Off),
            "static" => Ok(NdMode::Static),
            "proxy" => Ok(NdMode::Proxy),
            "proxy-ros" => Ok(NdMode::ProxyRos { strict: false }),
            "proxy-ros:strict" => Ok(NdMode::ProxyRos { strict: true }),
            other => Err(Error::Config(format!("unknown NDP_MODE '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NdConfig {
    pub mode: NdMode,
    pub prefixes: Vec<FlexibleIP>,
    pub excludes: Vec<FlexibleIP>,
    pub external_interfaces: Vec<String>,
    pub internal_interfaces: Vec<String>,
    pub timeout: Duration,
    pub advertise_macs: Vec<MacRef>,
}

impl NdConfig {
    pub fn disabled() -> Self {
        NdConfig {
            mode: NdMode::Off,
            prefixes: Vec::new(),
            excludes: Vec::new(),
            external_interfaces: Vec::new(),
            internal_interfaces: Vec::new(),
            timeout: Duration::from_millis(1000),
            advertise_macs: Vec::new(),
        }
    }

    pub fn dump(&self) {
        debug!("Neighbor Discovery configuration:");
        debug!("  NDP_MODE={:?}", self.mode);
        debug!("  NDP_TIMEOUT={}ms", self.timeout.as_millis());
        for (i, p) in self.prefixes.iter().enumerate() {
            debug!("  prefix {i}: {p}");
        }
        for (i, e) in self.excludes.iter().enumerate() {
            debug!("  exclude {i}: {e}");
        }
        debug!("  NDP_EXTERNAL_INTERFACES={:?}", self.external_interfaces);
        if !self.internal_interfaces.is_empty() {
            debug!("  NDP_INTERNAL_INTERFACES={:?}", self.internal_interfaces);
        }
        for (i, m) in self.advertise_macs.iter().enumerate() {
            debug!("  advertise mac {i}: {m}");
        }
    }
}

/// Router board API endpoint settings.
#[derive(Debug, Clone)]
pub struct RosConnectConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
}

fn getenv(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `FLEXIBLEIP@IFNAME[:option]*`. `@external` as the interface name
/// expands to `external_if`.
pub fn parse_ip_assign(s: &str, external_if: &str) -> Result<IpAssign> {
    let (ipstr, rest) = s
        .split_once('@')
        .ok_or_else(|| Error::Config(format!("ip assignment '{s}' has invalid format")))?;

    let mut split = rest.split(':');
    let mut ifname = split.next().unwrap_or_default().to_string();
    let opt_parts: Vec<&str> = split.collect();

    let ip: FlexibleIP = ipstr
        .parse()
        .map_err(|e| Error::Config(format!("ip assignment '{s}' has invalid ip specifier: {e}")))?;

    if ifname == "@external" {
        if external_if.is_empty() {
            return Err(Error::Config(format!(
                "ip assignment '{s}' has @external but RA_ROS_EXTERNAL_INTERFACE is empty"
            )));
        }
        ifname = external_if.to_string();
    } else if ifname.is_empty() || ifname.contains('@') {
        return Err(Error::Config(format!(
            "ip assignment '{s}' has invalid interface name '{ifname}'"
        )));
    }

    let mut options = AssignOptions::default();
    for opt in opt_parts {
        match opt {
            "eui-64" => options.eui64 = true,
            "advertise" => options.advertise = true,
            other => {
                return Err(Error::Config(format!(
                    "ip assignment '{s}' has unknown option '{other}'"
                )));
            }
        }
    }

    Ok(IpAssign {
        ip,
        ifname,
        options,
    })
}

/// Parse `FLEXIBLEIP@POOLNAME/PFXLEN`.
pub fn parse_pool_assign(s: &str) -> Result<PoolAssign> {
    let (ipstr, poolspec) = s
        .split_once('@')
        .ok_or_else(|| Error::Config(format!("pool assignment '{s}' has invalid format")))?;
    let (name, lenstr) = poolspec
        .split_once('/')
        .ok_or_else(|| Error::Config(format!("pool assignment '{s}' has invalid pool specifier")))?;

    let ip: FlexibleIP = ipstr.parse().map_err(|e| {
        Error::Config(format!(
            "pool assignment '{s}' has invalid ip specifier: {e}"
        ))
    })?;
    let prefix_len: u8 = lenstr
        .parse()
        .ok()
        .filter(|len| (1..=128).contains(len))
        .ok_or_else(|| {
            Error::Config(format!(
                "pool assignment '{s}' has invalid prefix length '{lenstr}'"
            ))
        })?;
    if name.is_empty() {
        return Err(Error::Config(format!(
            "pool assignment '{s}' has empty pool name"
        )));
    }

    Ok(PoolAssign {
        ip,
        name: name.to_string(),
        prefix_len,
    })
}

/// Parse one `NDP_ADVERTISE_MACS` entry: a literal MAC or `@IFNAME`.
/// `@@external` references the RA external interface.
pub fn parse_mac_ref(s: &str, external_if: &str) -> Result<MacRef> {
    if let Some(name) = s.strip_prefix('@') {
        let name = if name == "@external" {
            if external_if.is_empty() {
                return Err(Error::Config(
                    "NDP_ADVERTISE_MACS references @external but RA_ROS_EXTERNAL_INTERFACE is empty"
                        .into(),
                ));
            }
            external_if
        } else {
            name
        };
        return Ok(MacRef::Interface(name.to_string()));
    }
    Ok(MacRef::Literal(parse_mac(s)?))
}

pub fn load_ra_config() -> Result<RaConfig> {
    let mode = getenv("RA_MODE").unwrap_or_else(|| "ros".to_string());
    let mode = match mode.as_str() {
        "ros" => RaMode::Ros,
        "off" => RaMode::Off,
        other => return Err(Error::Config(format!("invalid RA_MODE '{other}'"))),
    };
    if mode == RaMode::Off {
        return Ok(RaConfig::disabled());
    }

    let external_interfaces = split_list(&getenv("RA_EXTERNAL_INTERFACES").ok_or_else(|| {
        Error::Config("RA_EXTERNAL_INTERFACES must list at least one interface".into())
    })?);
    if external_interfaces.is_empty() {
        return Err(Error::Config(
            "RA_EXTERNAL_INTERFACES must list at least one interface".into(),
        ));
    }

    let timeout_ms: u64 = getenv("RA_TIMEOUT")
        .unwrap_or_else(|| "5000".to_string())
        .parse()
        .map_err(|_| Error::Config("RA_TIMEOUT is not a valid integer".into()))?;

    let ros_external_interface = getenv("RA_ROS_EXTERNAL_INTERFACE").unwrap_or_default();

    let mut external_ips = Vec::new();
    for entry in split_list(&getenv("RA_ROS_EXTERNAL_IPS").unwrap_or_default()) {
        external_ips.push(parse_ip_assign(&entry, &ros_external_interface)?);
    }
    let mut internal_ips = Vec::new();
    for entry in split_list(&getenv("RA_ROS_INTERNAL_IPS").unwrap_or_default()) {
        internal_ips.push(parse_ip_assign(&entry, &ros_external_interface)?);
    }

    let pool_var = getenv("RA_ROS_POOLS").unwrap_or_else(|| "ra-prefix@fletsv6-pool/64".to_string());
    let mut pools = Vec::new();
    if pool_var != "none" {
        for entry in split_list(&pool_var) {
            pools.push(parse_pool_assign(&entry)?);
        }
    }

    Ok(RaConfig {
        mode,
        external_interfaces,
        timeout: Duration::from_millis(timeout_ms),
        ros_external_interface,
        external_ips,
        internal_ips,
        pools,
    })
}

/// Load the ND configuration. The second return value reports whether the
/// chosen mode or any symbolic advertise MAC needs the board client.
pub fn load_nd_config(ra: &RaConfig) -> Result<(NdConfig, bool)> {
    let mode: NdMode = getenv("NDP_MODE")
        .unwrap_or_else(|| "proxy-ros".to_string())
        .parse()?;
    if mode == NdMode::Off {
        return Ok((NdConfig::disabled(), false));
    }
    let mut needs_board = matches!(mode, NdMode::ProxyRos { .. });

    let mut prefixes = Vec::new();
    for entry in split_list(&getenv("NDP_PREFIXES").unwrap_or_else(|| "ra-prefix".to_string())) {
        let fip: FlexibleIP = entry
            .parse()
            .map_err(|e| Error::Config(format!("error while reading NDP_PREFIXES: {e}")))?;
        if fip.ra_prefix && ra.mode == RaMode::Off {
            return Err(Error::Config(
                "cannot use ra-prefix in NDP_PREFIXES while RA_MODE=off".into(),
            ));
        }
        prefixes.push(fip);
    }
    if prefixes.is_empty() {
        return Err(Error::Config(
            "NDP_PREFIXES must list at least one prefix".into(),
        ));
    }

    let exclude_var = getenv("NDP_EXCLUDE_IPS").unwrap_or_else(|| "ra-externalips".to_string());
    let mut excludes = Vec::new();
    if exclude_var != "none" {
        for entry in split_list(&exclude_var) {
            match entry.as_str() {
                "ra-externalips" => excludes.extend(ra.external_ips.iter().map(|a| a.ip)),
                "ra-internalips" => excludes.extend(ra.internal_ips.iter().map(|a| a.ip)),
                other => {
                    let fip: FlexibleIP = other.parse().map_err(|e| {
                        Error::Config(format!("error while reading NDP_EXCLUDE_IPS: {e}"))
                    })?;
                    excludes.push(fip);
                }
            }
        }
    }

    let external_interfaces =
        split_list(&getenv("NDP_EXTERNAL_INTERFACES").unwrap_or_else(|| "eth0".to_string()));
    if external_interfaces.is_empty() {
        return Err(Error::Config(
            "NDP_EXTERNAL_INTERFACES must list at least one interface".into(),
        ));
    }

    let internal_interfaces = if mode == NdMode::Proxy {
        let list = split_list(&getenv("NDP_INTERNAL_INTERFACES").unwrap_or_default());
        if list.is_empty() {
            return Err(Error::Config(
                "NDP_INTERNAL_INTERFACES must list at least one interface for NDP_MODE=proxy"
                    .into(),
            ));
        }
        list
    } else {
        Vec::new()
    };

    let timeout_ms: u64 = getenv("NDP_TIMEOUT")
        .unwrap_or_else(|| "1000".to_string())
        .parse()
        .map_err(|_| Error::Config("NDP_TIMEOUT is not a valid integer".into()))?;
    if matches!(mode, NdMode::ProxyRos { .. }) && !(10..=5000).contains(&timeout_ms) {
        return Err(Error::Config(format!(
            "NDP_TIMEOUT {timeout_ms} is out of range (10..5000)"
        )));
    }

    let mut advertise_macs = Vec::new();
    for entry in split_list(&getenv("NDP_ADVERTISE_MACS").unwrap_or_else(|| "@@external".to_string()))
    {
        let mac_ref = parse_mac_ref(&entry, &ra.ros_external_interface)?;
        if matches!(mac_ref, MacRef::Interface(_)) {
            needs_board = true;
        }
        advertise_macs.push(mac_ref);
    }
    // Positional alignment to the external interface list; a single entry
    // applies to every external interface.
    if advertise_macs.len() == 1 && external_interfaces.len() > 1 {
        let one = advertise_macs[0].clone();
        advertise_macs = vec![one; external_interfaces.len()];
    }
    if advertise_macs.len() != external_interfaces.len() {
        return Err(Error::Config(format!(
            "NDP_ADVERTISE_MACS lists {} entries for {} external interfaces",
            advertise_macs.len(),
            external_interfaces.len()
        )));
    }

    Ok((
        NdConfig {
            mode,
            prefixes,
            excludes,
            external_interfaces,
            internal_interfaces,
            timeout: Duration::from_millis(timeout_ms),
            advertise_macs,
        },
        needs_board,
    ))
}

pub fn load_ros_config() -> Result<RosConnectConfig> {
    let host = getenv("ROS_HOST").ok_or_else(|| {
        Error::Config("you must specify the routerboard api endpoint as ROS_HOST".into())
    })?;
    let use_tls = getenv("ROS_USETLS").as_deref() == Some("1");
    let port = match getenv("ROS_PORT") {
        Some(p) => p
            .parse()
            .map_err(|_| Error::Config(format!("invalid ROS_PORT '{p}'")))?,
        None if use_tls => 8729,
        None => 8728,
    };

    Ok(RosConnectConfig {
        host,
        port,
        username: getenv("ROS_USER").unwrap_or_else(|| "admin".to_string()),
        password: getenv("ROS_PASSWORD").unwrap_or_default(),
        use_tls,
    })
}
