//! RouterOS management API client.
//!
//! Speaks the RouterOS API sentence protocol (length-prefixed words,
//! `!re`/`!done`/`!trap` replies) over TCP, optionally inside TLS, and
//! implements the [`RouterBoard`] contract with idempotent upserts. Managed
//! objects carry a comment tag so reconciliation can find its own entries.
//!
//! Connections live in a small pool. A keepalive thread polls one pooled
//! connection with a cheap read and discards it on failure; `get` prefers a
//! pooled connection and falls back to dialing.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv6Addr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ipnet::Ipv6Net;
use tracing::{debug, info, warn};

use crate::board::{AssignOptions, RouterBoard, ZERO_MAC};
use crate::config::{RosConnectConfig, format_mac, parse_mac};
use crate::error::{Error, Result};
use crate::supervisor::Shutdown;

/// Comment tag marking objects owned by this daemon.
const COMMENT_TAG: &str = "set by fletsv6-companion";

/// Hard deadline for any single API call.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pooled connections kept warm.
const POOL_SIZE: usize = 2;

/// The keepalive visits one pooled connection per tick, covering the whole
/// pool every 10 seconds.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10 / POOL_SIZE as u64);

enum Transport {
    Plain(TcpStream),
    Tls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

type Attrs = HashMap<String, String>;

#[derive(Debug, Default)]
struct Reply {
    re: Vec<Attrs>,
    done: Attrs,
}

/// Encode a word length (RouterOS variable-length prefix).
fn write_len(w: &mut impl Write, len: u32) -> io::Result<()> {
    match len {
        0..0x80 => w.write_all(&[len as u8]),
        0x80..0x4000 => w.write_all(&((len | 0x8000) as u16).to_be_bytes()),
        0x4000..0x20_0000 => {
            let v = (len | 0xC0_0000).to_be_bytes();
            w.write_all(&v[1..])
        }
        0x20_0000..0x1000_0000 => w.write_all(&(len | 0xE000_0000).to_be_bytes()),
        _ => {
            w.write_all(&[0xF0])?;
            w.write_all(&len.to_be_bytes())
        }
    }
}

fn read_len(r: &mut impl Read) -> io::Result<u32> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first)?;
    let b = u32::from(first[0]);
    let (extra, base): (usize, u32) = match first[0] {
        0x00..0x80 => return Ok(b),
        0x80..0xC0 => (1, b & 0x3F),
        0xC0..0xE0 => (2, b & 0x1F),
        0xE0..0xF0 => (3, b & 0x0F),
        _ => (4, 0),
    };
    let mut len = base;
    let mut rest = [0u8; 4];
    r.read_exact(&mut rest[..extra])?;
    for byte in &rest[..extra] {
        len = (len << 8) | u32::from(*byte);
    }
    Ok(len)
}

fn write_sentence<S: AsRef<str>>(w: &mut impl Write, words: &[S]) -> io::Result<()> {
    for word in words {
        let bytes = word.as_ref().as_bytes();
        write_len(w, bytes.len() as u32)?;
        w.write_all(bytes)?;
    }
    write_len(w, 0)?;
    w.flush()
}

fn read_sentence(r: &mut impl Read) -> io::Result<Vec<String>> {
    let mut words = Vec::new();
    loop {
        let len = read_len(r)?;
        if len == 0 {
            return Ok(words);
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf)?;
        words.push(String::from_utf8_lossy(&buf).into_owned());
    }
}

fn parse_attrs(words: &[String]) -> Attrs {
    let mut attrs = Attrs::new();
    for word in words {
        if let Some(rest) = word.strip_prefix('=')
            && let Some((key, value)) = rest.split_once('=')
        {
            attrs.insert(key.to_string(), value.to_string());
        }
    }
    attrs
}

struct Connection {
    stream: Transport,
}

impl Connection {
    fn dial(cfg: &RosConnectConfig) -> Result<Connection> {
        let addr = (cfg.host.as_str(), cfg.port)
            .to_socket_addrs()
            .map_err(|e| Error::Board(format!("resolving {}: {e}", cfg.host)))?
            .next()
            .ok_or_else(|| Error::Board(format!("{} resolves to no address", cfg.host)))?;

        let stream = TcpStream::connect_timeout(&addr, CALL_TIMEOUT)
            .map_err(|e| Error::Board(format!("connecting {addr}: {e}")))?;
        stream
            .set_read_timeout(Some(CALL_TIMEOUT))
            .and_then(|()| stream.set_write_timeout(Some(CALL_TIMEOUT)))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|e| Error::Board(format!("socket options: {e}")))?;

        let transport = if cfg.use_tls {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| Error::Board(format!("tls: {e}")))?;
            let tls = connector
                .connect(&cfg.host, stream)
                .map_err(|e| Error::Board(format!("tls handshake: {e}")))?;
            Transport::Tls(Box::new(tls))
        } else {
            Transport::Plain(stream)
        };

        let mut conn = Connection { stream: transport };
        conn.login(cfg)?;
        Ok(conn)
    }

    fn login(&mut self, cfg: &RosConnectConfig) -> Result<()> {
        let reply = self.run(&[
            "/login".to_string(),
            format!("=name={}", cfg.username),
            format!("=password={}", cfg.password),
        ])?;
        // A =ret= challenge means the pre-6.43 MD5 login flow, which this
        // client does not speak.
        if reply.done.contains_key("ret") {
            return Err(Error::Board(
                "router requires the pre-6.43 challenge login".into(),
            ));
        }
        Ok(())
    }

    /// Run one command sentence and collect its reply.
    fn run<S: AsRef<str>>(&mut self, words: &[S]) -> Result<Reply> {
        write_sentence(&mut self.stream, words)
            .map_err(|e| Error::Board(format!("send: {e}")))?;

        let mut reply = Reply::default();
        let mut trap: Option<String> = None;
        loop {
            let sentence =
                read_sentence(&mut self.stream).map_err(|e| Error::Board(format!("recv: {e}")))?;
            let Some((tag, rest)) = sentence.split_first() else {
                continue;
            };
            match tag.as_str() {
                "!re" => reply.re.push(parse_attrs(rest)),
                "!done" => {
                    reply.done = parse_attrs(rest);
                    break;
                }
                "!trap" => {
                    let attrs = parse_attrs(rest);
                    trap.get_or_insert_with(|| {
                        attrs
                            .get("message")
                            .cloned()
                            .unwrap_or_else(|| "unknown error".into())
                    });
                }
                "!fatal" => {
                    return Err(Error::Board(format!(
                        "fatal: {}",
                        rest.first().cloned().unwrap_or_default()
                    )));
                }
                _ => {}
            }
        }
        if let Some(message) = trap {
            return Err(Error::Board(message));
        }
        Ok(reply)
    }
}

struct Pool {
    cfg: RosConnectConfig,
    idle: Mutex<Vec<Connection>>,
}

impl Pool {
    /// Prefer a pooled connection, fall back to dialing.
    fn get(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().unwrap().pop() {
            return Ok(conn);
        }
        Connection::dial(&self.cfg)
    }

    fn put(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < POOL_SIZE {
            idle.push(conn);
        }
    }

    /// Issue a cheap read on one pooled connection; discard it on failure.
    fn keepalive_tick(&self) {
        let Some(mut conn) = self.idle.lock().unwrap().pop() else {
            return;
        };
        match conn.run(&["/system/identity/print"]) {
            Ok(_) => self.put(conn),
            Err(e) => {
                warn!(error = %e, "Discarding stale board connection");
            }
        }
    }
}

/// Pooled RouterOS client implementing the board contract.
pub struct RosClient {
    pool: Arc<Pool>,
}

impl RosClient {
    /// Dial the board once to validate endpoint and credentials, then keep
    /// the connection pooled and start the keepalive thread.
    pub fn connect(cfg: RosConnectConfig, shutdown: &Shutdown) -> Result<RosClient> {
        let pool = Arc::new(Pool {
            cfg,
            idle: Mutex::new(Vec::new()),
        });

        let first = pool.get()?;
        pool.put(first);
        info!(host = %pool.cfg.host, port = pool.cfg.port, tls = pool.cfg.use_tls, "Router board API connected");

        let keepalive_pool = Arc::clone(&pool);
        let keepalive_shutdown = shutdown.clone();
        thread::Builder::new()
            .name("ros-keepalive".into())
            .spawn(move || {
                while !keepalive_shutdown.sleep(KEEPALIVE_INTERVAL) {
                    keepalive_pool.keepalive_tick();
                }
            })
            .map_err(Error::Socket)?;

        Ok(RosClient { pool })
    }

    /// Run `f` on a connection; broken connections are dropped instead of
    /// returned to the pool.
    fn call<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.pool.get()?;
        match f(&mut conn) {
            Ok(value) => {
                self.pool.put(conn);
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

fn attr_net_eq(attr: Option<&String>, net: Ipv6Net) -> bool {
    attr.and_then(|s| s.parse::<Ipv6Net>().ok()) == Some(net)
}

fn attr_eq(attr: Option<&String>, value: &str) -> bool {
    attr.map(String::as_str) == Some(value)
}

impl RouterBoard for RosClient {
    fn assign_address(
        &self,
        ifname: &str,
        address: Ipv6Net,
        key: &str,
        options: AssignOptions,
    ) -> Result<()> {
        let comment = format!("{COMMENT_TAG} {key}");
        self.call(|conn| {
            let reply = conn.run(&[
                "/ipv6/address/print".to_string(),
                "=.proplist=.id,comment,address,advertise,eui-64".to_string(),
                format!("?interface={ifname}"),
                "?dynamic=false".to_string(),
                "?#&".to_string(),
            ])?;

            let mut id = None;
            for item in &reply.re {
                if !attr_eq(item.get("comment"), &comment) {
                    continue;
                }
                id = item.get(".id").cloned();
                if attr_net_eq(item.get("address"), address)
                    && attr_eq(item.get("eui-64"), &options.eui64.to_string())
                    && attr_eq(item.get("advertise"), &options.advertise.to_string())
                {
                    debug!(ifname, address = %address, "Address already in desired state");
                    return Ok(());
                }
            }

            if let Some(id) = id {
                info!(ifname, address = %address, "Updating board address");
                conn.run(&[
                    "/ipv6/address/set".to_string(),
                    format!("=.id={id}"),
                    format!("=address={address}"),
                    format!("=advertise={}", options.advertise),
                    format!("=eui-64={}", options.eui64),
                ])?;
            } else {
                info!(ifname, address = %address, "Assigning board address");
                conn.run(&[
                    "/ipv6/address/add".to_string(),
                    format!("=interface={ifname}"),
                    format!("=address={address}"),
                    format!("=advertise={}", options.advertise),
                    format!("=eui-64={}", options.eui64),
                    format!("=comment={comment}"),
                ])?;
            }
            Ok(())
        })
    }

    fn set_default_gateway(&self, ifname: &str, gateway: Ipv6Addr) -> Result<()> {
        self.call(|conn| {
            let reply = conn.run(&[
                "/ipv6/route/print".to_string(),
                "=.proplist=.id,gateway,comment".to_string(),
                "?dst-address=::/0".to_string(),
            ])?;

            let mut target = None;
            for item in &reply.re {
                if attr_eq(item.get("comment"), COMMENT_TAG) {
                    target = item.get(".id").cloned();
                }
                if let Some((ip, gwif)) = item.get("gateway").and_then(|g| g.split_once('%'))
                    && ip.parse::<Ipv6Addr>().ok() == Some(gateway)
                    && gwif == ifname
                {
                    debug!(ifname, gateway = %gateway, "Default route already in desired state");
                    return Ok(());
                }
            }

            let gw = format!("{gateway}%{ifname}");
            if let Some(id) = target {
                info!(gateway = %gw, "Updating board default gateway");
                conn.run(&[
                    "/ipv6/route/set".to_string(),
                    format!("=.id={id}"),
                    format!("=gateway={gw}"),
                ])?;
            } else {
                info!(gateway = %gw, "Adding board default gateway");
                conn.run(&[
                    "/ipv6/route/add".to_string(),
                    "=dst-address=::/0".to_string(),
                    format!("=gateway={gw}"),
                    format!("=comment={COMMENT_TAG}"),
                ])?;
            }
            Ok(())
        })
    }

    fn declare_pool(&self, name: &str, prefix: Ipv6Net, sub_prefix_len: u8) -> Result<()> {
        self.call(|conn| {
            let reply = conn.run(&[
                "/ipv6/pool/print".to_string(),
                format!("?name={name}"),
            ])?;

            if let Some(item) = reply.re.first() {
                if attr_net_eq(item.get("prefix"), prefix)
                    && attr_eq(item.get("prefix-length"), &sub_prefix_len.to_string())
                {
                    debug!(name, "Pool already in desired state");
                    return Ok(());
                }
                let id = item
                    .get(".id")
                    .cloned()
                    .ok_or_else(|| Error::Board("pool entry without .id".into()))?;
                info!(name, prefix = %prefix, "Updating board pool");
                conn.run(&[
                    "/ipv6/pool/set".to_string(),
                    format!("=.id={id}"),
                    format!("=prefix={prefix}"),
                    format!("=prefix-length={sub_prefix_len}"),
                ])?;
            } else {
                info!(name, prefix = %prefix, "Declaring board pool");
                conn.run(&[
                    "/ipv6/pool/add".to_string(),
                    format!("=name={name}"),
                    format!("=prefix={prefix}"),
                    format!("=prefix-length={sub_prefix_len}"),
                ])?;
            }
            Ok(())
        })
    }

    fn lookup_neighbor(
        &self,
        addr: Ipv6Addr,
        timeout_ms: u64,
        strict: bool,
    ) -> Result<Option<[u8; 6]>> {
        self.call(|conn| {
            // One reachability probe with the caller's interval, then a
            // neighbor table read.
            let interval = format!("00:00:0{}.{:03}", timeout_ms / 1000, timeout_ms % 1000);
            let echo_ok = match conn.run(&[
                "/ping".to_string(),
                format!("=address={addr}"),
                "=count=1".to_string(),
                format!("=interval={interval}"),
            ]) {
                Ok(reply) => reply
                    .re
                    .iter()
                    .any(|r| r.get("received").is_some_and(|v| v != "0")),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Reachability probe failed");
                    false
                }
            };

            let reply = conn.run(&[
                "/ipv6/neighbor/print".to_string(),
                "=.proplist=mac-address,status".to_string(),
                format!("?address={addr}"),
            ])?;
            let entry = reply.re.iter().find(|r| {
                matches!(
                    r.get("status").map(String::as_str),
                    Some("reachable") | Some("stale")
                )
            });
            if let Some(entry) = entry
                && let Some(mac) = entry.get("mac-address").and_then(|m| parse_mac(m).ok())
            {
                debug!(addr = %addr, mac = %format_mac(&mac), "Neighbor table hit");
                return Ok(Some(mac));
            }

            if !strict && echo_ok {
                debug!(addr = %addr, "No table entry but echo succeeded, using zero MAC");
                return Ok(Some(ZERO_MAC));
            }
            Ok(None)
        })
    }

    fn interface_mac(&self, ifname: &str) -> Result<[u8; 6]> {
        self.call(|conn| {
            let reply = conn.run(&[
                "/interface/print".to_string(),
                "=.proplist=mac-address".to_string(),
                format!("?name={ifname}"),
            ])?;
            reply
                .re
                .first()
                .and_then(|item| item.get("mac-address"))
                .and_then(|m| parse_mac(m).ok())
                .ok_or_else(|| Error::Board(format!("no MAC for interface '{ifname}'")))
        })
    }
}
