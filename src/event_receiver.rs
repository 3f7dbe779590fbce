//! The GENA event receiver (§4.6): a small axum server that accepts
//! `NOTIFY /` requests on the port advertised in every SUBSCRIBE's CALLBACK
//! header, and dispatches accepted property changes to registered listeners.
//! Also receives the optional multicast event variant: `NOTIFY * HTTP/1.1`
//! tagged with `LVL`/`SEQ`/`SVCID`/`USN`, delivered to a separate listener set.
//!
//! Grounded on the donor's own [`crate::router`] — same "build a Router,
//! `.with_state`, route by path" shape — generalised from a device-side
//! description/SOAP server to a control-point NOTIFY sink. The multicast half
//! reuses `ssdp.rs`'s multicast socket setup, joined to the event group
//! instead of the SSDP group.

use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    routing::any,
    Router,
};
use quick_xml::events::Event;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::{model, registry::DeviceHolder, ssdp::InterfaceAddress, XmlReaderExt};

/// Multicast group UPnP multicast eventing NOTIFYs are sent to.
pub(crate) const EVENT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 246);
pub(crate) const EVENT_MULTICAST_PORT: u16 = 7900;

/// Notified once per accepted (and variable-matched) property in a NOTIFY body.
pub trait EventListener: Send + Sync {
    fn on_notify_event(&self, service: model::Service, seq: Option<u64>, variable_name: &str, value: &str);
}

/// Notified once per multicast-eventing NOTIFY (§4.6 multicast variant, §6
/// collaborator contract); properties are delivered together rather than one
/// at a time since the multicast NOTIFY carries no per-Service SID to look up
/// `sendEvents` against.
pub trait NotifyEventListener: Send + Sync {
    fn on_event(&self, uuid: &str, svcid: &str, lvl: &str, seq: Option<u64>, properties: &[(String, String)]);
}

#[derive(Clone)]
pub struct EventReceiverState {
    registry: Arc<DeviceHolder>,
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
    multicast_listeners: Arc<RwLock<Vec<Arc<dyn NotifyEventListener>>>>,
}

impl EventReceiverState {
    pub fn new(registry: Arc<DeviceHolder>) -> Self {
        Self {
            registry,
            listeners: Arc::new(RwLock::new(Vec::new())),
            multicast_listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Copy-on-write registration: readers on the hot NOTIFY path never
    /// contend with writers (§5).
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        let mut guard = self.listeners.write().expect("listener lock poisoned");
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = next;
    }

    pub fn add_multicast_listener(&self, listener: Arc<dyn NotifyEventListener>) {
        let mut guard = self.multicast_listeners.write().expect("listener lock poisoned");
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = next;
    }

    fn listeners(&self) -> Arc<Vec<Arc<dyn EventListener>>> {
        let guard = self.listeners.read().expect("listener lock poisoned");
        Arc::new((*guard).clone())
    }

    fn multicast_listeners(&self) -> Arc<Vec<Arc<dyn NotifyEventListener>>> {
        let guard = self.multicast_listeners.read().expect("listener lock poisoned");
        Arc::new((*guard).clone())
    }
}

pub struct EventReceiver {
    listener: TcpListener,
}

impl EventReceiver {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, state: EventReceiverState, cancellation_token: CancellationToken) {
        let router = Router::new().route("/", any(handle_notify)).with_state(state);
        let result = axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { cancellation_token.cancelled().await })
            .await;
        if let Err(err) = result {
            tracing::error!("event receiver server exited: {err}");
        }
    }
}

async fn handle_notify(State(state): State<EventReceiverState>, method: Method, headers: HeaderMap, body: String) -> StatusCode {
    if method.as_str() != "NOTIFY" {
        return StatusCode::METHOD_NOT_ALLOWED;
    }

    let Some(sid) = header_str(&headers, "SID") else {
        return StatusCode::BAD_REQUEST;
    };
    let seq = header_str(&headers, "SEQ").and_then(|s| s.parse::<u64>().ok());

    let Some((udn, service_id)) = state.registry.find_by_sid(sid).await else {
        return StatusCode::PRECONDITION_FAILED;
    };

    let properties = match parse_property_set(&body) {
        Ok(properties) => properties,
        Err(err) => {
            tracing::warn!("malformed NOTIFY body for sid {sid}: {err:#}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let Some(device) = state.registry.get(&udn).await else {
        return StatusCode::PRECONDITION_FAILED;
    };
    let Some(service) = device.all_services().find(|s| s.service_id == service_id).cloned() else {
        return StatusCode::PRECONDITION_FAILED;
    };

    let accepted: Vec<(String, String)> = properties
        .into_iter()
        .filter(|(name, _)| service.find_variable(name).is_some_and(|i| service.state_variables[i].send_events))
        .collect();

    // Dispatch happens off the request path: a slow EventListener must never
    // stall the publisher waiting on this response (§4.6).
    if !accepted.is_empty() {
        let listeners = state.listeners();
        tokio::spawn(async move {
            for (name, value) in &accepted {
                for listener in listeners.iter() {
                    listener.on_notify_event(service.clone(), seq, name, value);
                }
            }
        });
    }

    StatusCode::OK
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

/// Parses a GENA `<e:propertyset>` body into (name, value) pairs, ignoring
/// the `e:` namespace prefix the way the rest of this crate matches only on
/// local names.
fn parse_property_set(body: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut reader = quick_xml::Reader::from_str(body);
    let root = reader.read_to_start()?;
    anyhow::ensure!(root.local_name().as_ref() == b"propertyset", "expected propertyset root");

    let mut properties = Vec::new();
    loop {
        let event = reader.read_event_err_eof()?;
        match event {
            Event::Start(start) if start.local_name().as_ref() == b"property" => {
                loop {
                    match reader.read_event_err_eof()? {
                        Event::Start(start) => {
                            let name = String::from_utf8_lossy(start.local_name().as_ref()).to_string();
                            let value = reader.read_text(start.name())?.to_string();
                            properties.push((name, value));
                        }
                        Event::End(end) if end.local_name().as_ref() == b"property" => break,
                        Event::Text(_) => {}
                        other => anyhow::bail!("unexpected event inside property: {other:?}"),
                    }
                }
            }
            Event::End(end) if end.local_name().as_ref() == b"propertyset" => break,
            Event::Text(_) => {}
            other => anyhow::bail!("unexpected event at propertyset level: {other:?}"),
        }
    }

    Ok(properties)
}

/// Receives the optional multicast event variant of §4.6: one socket per
/// interface, joined to [`EVENT_MULTICAST_ADDR`] instead of the SSDP group,
/// reusing `ssdp::bind_multicast_socket`.
pub struct MulticastEventReceiver {
    socket: UdpSocket,
}

impl MulticastEventReceiver {
    pub fn bind(interface: &InterfaceAddress) -> anyhow::Result<Self> {
        let socket = crate::ssdp::bind_multicast_socket(interface, EVENT_MULTICAST_ADDR, EVENT_MULTICAST_PORT, None)
            .with_context(|| format!("bind multicast event socket on {}", interface.name))?;
        Ok(Self { socket })
    }

    pub async fn run(self, state: EventReceiverState, cancellation_token: CancellationToken) {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let Ok((len, source)) = received else {
                        continue;
                    };
                    if let Err(err) = handle_multicast_datagram(&buf[..len], &state) {
                        tracing::warn!("failed to handle multicast event datagram from {source}: {err:#}");
                    }
                }
                _ = cancellation_token.cancelled() => break,
            }
        }
    }
}

fn handle_multicast_datagram(data: &[u8], state: &EventReceiverState) -> anyhow::Result<()> {
    let payload = std::str::from_utf8(data).context("multicast notify payload is not utf-8")?;
    let (head, body) = payload.split_once("\r\n\r\n").context("missing header/body separator")?;
    let mut lines = head.lines();
    let request_line = lines.next().context("request line")?;
    anyhow::ensure!(request_line.starts_with("NOTIFY"), "expected NOTIFY request line");

    let mut uuid = None;
    let mut svcid = None;
    let mut lvl = None;
    let mut seq = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_uppercase().as_str() {
            "USN" => uuid = Some(value.trim().to_string()),
            "SVCID" => svcid = Some(value.trim().to_string()),
            "LVL" => lvl = Some(value.trim().to_string()),
            "SEQ" => seq = value.trim().parse::<u64>().ok(),
            _ => {}
        }
    }
    let uuid = uuid.context("missing USN")?;
    let svcid = svcid.context("missing SVCID")?;
    let lvl = lvl.context("missing LVL")?;

    let properties = parse_property_set(body)?;

    let listeners = state.multicast_listeners();
    tokio::spawn(async move {
        for listener in listeners.iter() {
            listener.on_event(&uuid, &svcid, &lvl, seq, &properties);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_property_set_body() {
        let body = r#"<?xml version="1.0"?>
<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
  <e:property><Volume>42</Volume></e:property>
  <e:property><Mute>0</Mute></e:property>
</e:propertyset>"#;
        let properties = parse_property_set(body).unwrap();
        assert_eq!(properties, vec![("Volume".to_string(), "42".to_string()), ("Mute".to_string(), "0".to_string())]);
    }

    #[test_log::test(tokio::test)]
    async fn multicast_notify_headers_parse() {
        let datagram = "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.246:7900\r\n\
NT: upnp:event\r\n\
NTS: upnp:propchange\r\n\
SVCID: urn:upnp-org:serviceId:ContentDirectory\r\n\
USN: uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241\r\n\
LVL: upnp:/target\r\n\
SEQ: 7\r\n\
CONTENT-LENGTH: 0\r\n\
\r\n\
<?xml version=\"1.0\"?><e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\"><e:property><Volume>10</Volume></e:property></e:propertyset>";

        let state = EventReceiverState::new(DeviceHolder::new());
        assert!(handle_multicast_datagram(datagram.as_bytes(), &state).is_ok());
    }
}
