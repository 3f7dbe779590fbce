//! Simple Service Discovery Protocol ([SSDP](https://en.wikipedia.org/wiki/Simple_Service_Discovery_Protocol)) implementation.
//!
//! A control point never announces itself as a device: this module only
//! receives multicast `NOTIFY` advertisements, sends `M-SEARCH` requests and
//! receives their unicast responses, one socket per network interface to
//! preserve source-address fidelity.

use core::str;
use std::{
    fmt::Display,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use socket2::{Domain, Protocol, Type};
use tokio::{net::UdpSocket, sync::Notify};
use tokio_util::sync::CancellationToken;

pub(crate) const SSDP_IP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub(crate) const SSDP_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(SSDP_IP_ADDR, 1900));
pub(crate) const DEFAULT_SSDP_TTL: u32 = 2;

/// IPv4 address plus subnet prefix of one interface worth binding a receiver to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub name: String,
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl InterfaceAddress {
    /// Per §4.1: drop if `source` lies outside this interface's prefix.
    /// Masking is applied byte-wise then bit-wise on the partial byte.
    pub fn contains(&self, source: Ipv4Addr) -> bool {
        let mask = if self.prefix == 0 {
            0u32
        } else {
            u32::MAX << (32 - self.prefix as u32)
        };
        let ours = u32::from_be_bytes(self.addr.octets()) & mask;
        let theirs = u32::from_be_bytes(source.octets()) & mask;
        ours == theirs
    }
}

/// Enumerate non-loopback IPv4-capable interfaces suitable for multicast.
pub fn list_interfaces() -> anyhow::Result<Vec<InterfaceAddress>> {
    let interfaces = NetworkInterface::show().context("enumerate network interfaces")?;
    let mut out = Vec::new();
    for iface in interfaces {
        for addr in &iface.addr {
            let Addr::V4(v4) = addr else {
                continue;
            };
            if v4.ip.is_loopback() || v4.ip.is_unspecified() {
                continue;
            }
            let prefix = v4
                .netmask
                .map(|mask| u32::from_be_bytes(mask.octets()).count_ones() as u8)
                .unwrap_or(24);
            out.push(InterfaceAddress {
                name: iface.name.clone(),
                addr: v4.ip,
                prefix,
            });
        }
    }
    Ok(out)
}

pub(crate) fn bind_multicast_socket(interface: &InterfaceAddress, group: Ipv4Addr, port: u16, ttl: Option<u32>) -> anyhow::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_ttl(ttl.unwrap_or(DEFAULT_SSDP_TTL))?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    socket.join_multicast_v4(&group, &interface.addr)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn bind_unicast_socket(interface: &InterfaceAddress) -> anyhow::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(interface.addr, 0)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

/// A message handed up from a receiver loop once it passes the per-packet
/// validation algorithm. Search responses are forwarded identically to alive
/// notifications (§4.2).
#[derive(Debug, Clone)]
pub enum SsdpEvent {
    Notify(SsdpMessage),
    SearchResponse(SsdpMessage),
}

/// Receives either multicast NOTIFY (bound to 1900, joined to the group) or
/// unicast M-SEARCH responses (bound to an ephemeral port on the interface).
pub struct SsdpReceiver {
    pub interface: InterfaceAddress,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<ReceiverState>>,
    ready: Arc<Notify>,
    is_notify: bool,
}

impl SsdpReceiver {
    pub fn bind_notify(interface: InterfaceAddress, ttl: Option<u32>) -> anyhow::Result<Self> {
        let socket = bind_multicast_socket(&interface, SSDP_IP_ADDR, 1900, ttl)
            .with_context(|| format!("bind ssdp notify socket on {}", interface.name))?;
        Ok(Self {
            interface,
            socket: Arc::new(socket),
            state: Arc::new(Mutex::new(ReceiverState::NotStarted)),
            ready: Arc::new(Notify::new()),
            is_notify: true,
        })
    }

    pub fn bind_search(interface: InterfaceAddress) -> anyhow::Result<Self> {
        let socket = bind_unicast_socket(&interface)
            .with_context(|| format!("bind ssdp search socket on {}", interface.name))?;
        Ok(Self {
            interface,
            socket: Arc::new(socket),
            state: Arc::new(Mutex::new(ReceiverState::NotStarted)),
            ready: Arc::new(Notify::new()),
            is_notify: false,
        })
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn set_state(&self, state: ReceiverState) {
        *self.state.lock().expect("state mutex poisoned") = state;
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Waits for the receiver to reach `Ready`, capped at 3 seconds per §4.1.
    pub async fn wait_ready(&self) -> bool {
        if self.state() == ReceiverState::Ready {
            return true;
        }
        let wait = self.ready.notified();
        tokio::select! {
            _ = wait => self.state() == ReceiverState::Ready,
            _ = tokio::time::sleep(Duration::from_secs(3)) => self.state() == ReceiverState::Ready,
        }
    }

    /// Runs the receive loop until cancelled, applying the per-packet
    /// algorithm from §4.1 and forwarding accepted messages to `tx`.
    pub async fn run(
        &self,
        segment_check: bool,
        tx: tokio::sync::mpsc::Sender<SsdpEvent>,
        cancellation_token: CancellationToken,
    ) {
        self.set_state(ReceiverState::Starting);
        self.set_state(ReceiverState::Ready);
        self.ready.notify_waiters();

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let Ok((len, source)) = received else {
                        continue;
                    };
                    if let Err(err) = self.handle_datagram(&buf[..len], source, segment_check, &tx).await {
                        tracing::warn!("failed to handle ssdp datagram from {source}: {err:#}");
                    }
                }
                _ = cancellation_token.cancelled() => {
                    break;
                }
            }
        }
        self.set_state(ReceiverState::Stopping);
        self.set_state(ReceiverState::Stopped);
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        source: SocketAddr,
        segment_check: bool,
        tx: &tokio::sync::mpsc::Sender<SsdpEvent>,
    ) -> anyhow::Result<()> {
        let SocketAddr::V4(source_v4) = source else {
            anyhow::bail!("ipv6 datagram on ipv4 socket");
        };

        if segment_check && !self.interface.contains(*source_v4.ip()) {
            tracing::trace!(
                "dropping ssdp datagram from {source} outside {}/{}",
                self.interface.addr,
                self.interface.prefix
            );
            return Ok(());
        }

        let payload = str::from_utf8(data).context("ssdp payload is not utf-8")?;
        let parsed = HttpSsdpMessage::parse(payload)?;

        match parsed {
            HttpSsdpMessage::Search(_) => {
                if self.is_notify {
                    tracing::trace!("dropping self-echoed M-SEARCH on notify receiver");
                }
                Ok(())
            }
            HttpSsdpMessage::SearchResponse(announce) => {
                let message = SsdpMessage::from_announce(announce, source, NotificationSubType::Alive);
                if location_host_matches(&message.location, source_v4.ip()) {
                    let _ = tx.send(SsdpEvent::SearchResponse(message)).await;
                } else {
                    tracing::warn!("dropping search response with mismatched LOCATION host from {source}");
                }
                Ok(())
            }
            HttpSsdpMessage::Notify(notify) => {
                let nts = notify.nts;
                let message = SsdpMessage::from_notify(notify, source);
                if nts == NotificationSubType::ByeBye || location_host_matches(&message.location, source_v4.ip()) {
                    let _ = tx.send(SsdpEvent::Notify(message)).await;
                } else {
                    tracing::warn!("dropping NOTIFY with mismatched LOCATION host from {source}");
                }
                Ok(())
            }
        }
    }

    pub async fn send_search(&self, message: &SearchMessage<'_>) -> anyhow::Result<()> {
        self.socket
            .send_to(message.to_string().as_bytes(), SSDP_ADDR)
            .await
            .context("send M-SEARCH")?;
        Ok(())
    }
}

fn location_host_matches(location: &Option<String>, source: &Ipv4Addr) -> bool {
    let Some(location) = location else {
        return false;
    };
    let Ok(url) = reqwest::Url::parse(location) else {
        return false;
    };
    match url.host_str() {
        Some(host) => host == source.to_string(),
        None => false,
    }
}

///  Unique Service Name. Identifies a unique instance of a device or service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct USN {
    pub udn: String,
    pub kind: USNkind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum USNkind {
    RootDevice,
    DeviceUuid,
    URN(crate::urn::URN),
}

impl USN {
    pub const fn root_device(udn: String) -> Self {
        Self {
            udn,
            kind: USNkind::RootDevice,
        }
    }
    pub const fn device_uuid(udn: String) -> Self {
        Self {
            udn,
            kind: USNkind::DeviceUuid,
        }
    }

    pub fn uuid(&self) -> Option<uuid::Uuid> {
        self.udn.strip_prefix("uuid:").and_then(|s| s.parse().ok())
    }
}

impl Display for USN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.udn)?;
        match &self.kind {
            USNkind::RootDevice => write!(f, "::upnp:rootdevice"),
            USNkind::DeviceUuid => Ok(()),
            USNkind::URN(urn) => write!(f, "::{urn}"),
        }
    }
}

impl FromStr for USN {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((udn, rest)) = s.split_once("::") else {
            anyhow::ensure!(s.starts_with("uuid:"), "usn missing uuid prefix");
            return Ok(Self::device_uuid(s.to_string()));
        };
        anyhow::ensure!(udn.starts_with("uuid:"), "usn missing uuid prefix");
        if rest == "upnp:rootdevice" {
            return Ok(Self::root_device(udn.to_string()));
        }
        let urn = crate::urn::URN::from_str(rest)?;
        Ok(Self {
            udn: udn.to_string(),
            kind: USNkind::URN(urn),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationType {
    /// `ssdp:all` search target: any UPnP device or service.
    All,
    /// `upnp:rootdevice`
    RootDevice,
    Uuid(uuid::Uuid),
    Urn(crate::urn::URN),
}

impl FromStr for NotificationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:all" => Self::All,
            "upnp:rootdevice" => Self::RootDevice,
            rest if rest.starts_with("urn:") => Self::Urn(crate::urn::URN::from_str(rest)?),
            rest if rest.starts_with("uuid:") => Self::Uuid(
                rest.strip_prefix("uuid:")
                    .expect("prefix checked above")
                    .parse()?,
            ),
            rest => Err(anyhow::anyhow!("Unknown notification type: {rest}"))?,
        })
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::All => write!(f, "ssdp:all"),
            NotificationType::RootDevice => write!(f, "upnp:rootdevice"),
            NotificationType::Uuid(id) => write!(f, "uuid:{id}"),
            NotificationType::Urn(urn) => write!(f, "{urn}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Notification subtype. Specifies type of notification.
pub enum NotificationSubType {
    Alive,
    ByeBye,
    /// Treated as equivalent to `Alive` by the loader (§9 open question):
    /// refreshes max-age and the stored SSDP message without reloading.
    Update,
}

impl Display for NotificationSubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            NotificationSubType::Alive => "alive",
            NotificationSubType::ByeBye => "byebye",
            NotificationSubType::Update => "update",
        };
        write!(f, "ssdp:{msg}")
    }
}

impl FromStr for NotificationSubType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:alive" => Self::Alive,
            "ssdp:byebye" => Self::ByeBye,
            "ssdp:update" => Self::Update,
            rest => Err(anyhow::anyhow!("Unknown notification sub type: {rest}"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchMessage<'a> {
    pub host: SocketAddr,
    pub st: NotificationType,
    pub mx: usize,
    pub user_agent: Option<&'a str>,
}

impl Display for SearchMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "M-SEARCH * HTTP/1.1\r\n\
HOST: {host}\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: {mx}\r\n\
ST: {search_target}\r\n",
            host = self.host,
            mx = self.mx,
            search_target = self.st,
        )?;
        if let Some(user_agent) = self.user_agent {
            write!(f, "USER-AGENT: {user_agent}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

/// A parsed HTTP-form SSDP packet plus the source it arrived from. Derived
/// fields mirror the UPnP headers: UUID (from USN), NT/ST, NTS, LOCATION and
/// max-age (from CACHE-CONTROL).
#[derive(Debug, Clone)]
pub struct SsdpMessage {
    pub usn: USN,
    pub nt: NotificationType,
    pub nts: NotificationSubType,
    pub location: Option<String>,
    pub server: Option<String>,
    pub max_age: Option<u64>,
    pub source: SocketAddr,
}

impl SsdpMessage {
    pub fn uuid(&self) -> Option<uuid::Uuid> {
        self.usn.uuid()
    }

    fn from_notify(notify: NotifyMessage, source: SocketAddr) -> Self {
        Self {
            usn: notify.usn,
            nt: notify.nt,
            nts: notify.nts,
            location: notify.location,
            server: notify.server,
            max_age: notify.max_age,
            source,
        }
    }

    fn from_announce(announce: Announce, source: SocketAddr, nts: NotificationSubType) -> Self {
        Self {
            usn: announce.usn,
            nt: announce.notification_type,
            nts,
            location: Some(announce.location),
            server: Some(announce.server),
            max_age: Some(announce.cache_control as u64),
            source,
        }
    }
}

/// Raw unicast search response (`HTTP/1.1 200 OK`), parsed the same way a
/// NOTIFY alive is, minus the NT/NTS split (ST doubles for both).
#[derive(Debug, Clone)]
pub struct Announce {
    pub cache_control: usize,
    pub location: String,
    pub server: String,
    pub notification_type: NotificationType,
    pub usn: USN,
}

#[derive(Debug, Clone)]
struct NotifyMessage {
    usn: USN,
    nt: NotificationType,
    nts: NotificationSubType,
    location: Option<String>,
    server: Option<String>,
    max_age: Option<u64>,
}

#[derive(Debug)]
enum HttpSsdpMessage<'a> {
    Search(RawSearch<'a>),
    SearchResponse(Announce),
    Notify(NotifyMessage),
}

#[derive(Debug)]
struct RawSearch<'a> {
    #[allow(dead_code)]
    pub st: &'a str,
}

impl<'a> HttpSsdpMessage<'a> {
    fn parse(s: &'a str) -> anyhow::Result<Self> {
        let mut lines = s.lines();
        let request_line = lines.next().context("request line")?;
        let headers = lines.filter_map(|l| l.split_once(':').map(|(n, v)| (n, v.trim())));

        if request_line.starts_with("M-SEARCH") {
            let mut st = None;
            for (name, value) in headers {
                if name.eq_ignore_ascii_case("st") {
                    st = Some(value);
                }
            }
            return Ok(HttpSsdpMessage::Search(RawSearch {
                st: st.context("missing st")?,
            }));
        }

        if request_line.starts_with("HTTP/1.1 200") {
            let mut cache_control = None;
            let mut location = None;
            let mut server = None;
            let mut notification_type = None;
            let mut usn = None;
            for (name, value) in headers {
                match name.to_ascii_lowercase().as_str() {
                    "cache-control" => cache_control = Some(parse_max_age(value)?),
                    "location" => location = Some(value.to_owned()),
                    "server" => server = Some(value.to_owned()),
                    "st" => notification_type = Some(NotificationType::from_str(value)?),
                    "usn" => usn = Some(USN::from_str(value)?),
                    _ => (),
                }
            }
            return Ok(HttpSsdpMessage::SearchResponse(Announce {
                cache_control: cache_control.context("missing cache-control")?,
                location: location.context("missing location")?,
                server: server.context("missing server")?,
                notification_type: notification_type.context("missing st")?,
                usn: usn.context("missing usn")?,
            }));
        }

        if request_line.starts_with("NOTIFY") {
            let mut location = None;
            let mut server = None;
            let mut nt = None;
            let mut nts = None;
            let mut usn = None;
            let mut max_age = None;
            for (name, value) in headers {
                match name.to_ascii_lowercase().as_str() {
                    "location" => location = Some(value.to_owned()),
                    "server" => server = Some(value.to_owned()),
                    "nt" => nt = Some(NotificationType::from_str(value)?),
                    "nts" => nts = Some(NotificationSubType::from_str(value)?),
                    "usn" => usn = Some(USN::from_str(value)?),
                    "cache-control" => max_age = Some(parse_max_age(value)?),
                    _ => (),
                }
            }
            return Ok(HttpSsdpMessage::Notify(NotifyMessage {
                usn: usn.context("missing usn")?,
                nt: nt.context("missing nt")?,
                nts: nts.context("missing nts")?,
                location,
                server,
                max_age,
            }));
        }

        anyhow::bail!("unrecognized ssdp request line: {request_line}")
    }
}

fn parse_max_age(value: &str) -> anyhow::Result<u64> {
    let (prefix, duration) = value.split_once('=').context("split cache control")?;
    anyhow::ensure!(prefix.trim() == "max-age", "expected max-age directive");
    duration.trim().parse().context("parse max-age seconds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_notify_alive() {
        let notify = "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
CACHE-CONTROL: max-age=1800\r\n\
LOCATION: http://192.168.1.1:49152/IGDdevicedesc.xml\r\n\
NT: urn:schemas-upnp-org:service:WANEthernetLinkConfig:1\r\n\
NTS: ssdp:alive\r\n\
SERVER: Linux/3.14.77, UPnP/1.0, Portable SDK for UPnP devices/1.6.19\r\n\
USN: uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::urn:schemas-upnp-org:service:WANEthernetLinkConfig:1\r\n\r\n";

        let parsed = HttpSsdpMessage::parse(notify).unwrap();
        match parsed {
            HttpSsdpMessage::Notify(n) => {
                assert_eq!(n.nts, NotificationSubType::Alive);
                assert_eq!(n.max_age, Some(1800));
            }
            other => panic!("expected notify, got {other:?}"),
        }
    }

    #[test]
    fn parse_m_search() {
        let m_search = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 1\r\n\
ST: urn:dial-multiscreen-org:service:dial:1\r\n\r\n";
        let parsed = HttpSsdpMessage::parse(m_search).unwrap();
        assert!(matches!(parsed, HttpSsdpMessage::Search(_)));
    }

    #[test]
    fn usn_round_trip() {
        let raw = "uuid:01234567-89ab-cdef-0123-456789abcdef::upnp:rootdevice";
        let usn: USN = raw.parse().unwrap();
        assert_eq!(usn.to_string(), raw);
        assert!(usn.uuid().is_some());
    }

    #[test]
    fn ipv4_segment_check() {
        let iface = InterfaceAddress {
            name: "eth0".into(),
            addr: Ipv4Addr::new(192, 168, 0, 1),
            prefix: 24,
        };
        assert!(iface.contains(Ipv4Addr::new(192, 168, 0, 255)));
        assert!(!iface.contains(Ipv4Addr::new(192, 168, 1, 255)));

        let iface23 = InterfaceAddress { prefix: 23, ..iface };
        assert!(iface23.contains(Ipv4Addr::new(192, 168, 1, 255)));
    }
}
