//! Runtime object graph discovered from a device's description and SCPD documents.
//!
//! Unlike a device-side implementation, a control point cannot know a service's
//! actions and state variables at compile time - it learns them from whatever
//! XML the device on the wire happens to serve. The graph below is therefore
//! arena-style: every record is built from plain parsed fields first, and a
//! single resolution pass afterwards links `Argument`s to the `StateVariable`
//! they reference, and `Service`s to their owning `Device`, by integer index
//! rather than by pointer or by generic type parameter.

use std::time::{Duration, Instant};

use crate::service_variables::{DataType, Range};
use crate::ssdp::SsdpMessage;

/// A discovered UPnP root or embedded device.
#[derive(Debug, Clone)]
pub struct Device {
    pub udn: String,
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub model_description: Option<String>,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub manufacturer_url: Option<String>,
    pub serial_number: Option<String>,
    pub presentation_url: Option<String>,
    /// Base URL description/SCPD/control/eventSub URLs are resolved against.
    pub base_url: reqwest::Url,
    /// Network-layer source the announcement arrived from.
    pub remote_addr: std::net::IpAddr,
    pub icon_list: Vec<Icon>,
    pub device_list: Vec<Device>,
    pub service_list: Vec<Service>,
    /// The SSDP message that most recently announced this device.
    pub ssdp_message: SsdpMessage,
    pub expiry: Instant,
}

impl Device {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiry
    }

    pub fn refresh(&mut self, message: SsdpMessage, max_age: Duration) {
        self.expiry = Instant::now() + max_age;
        self.ssdp_message = message;
    }

    pub fn all_services(&self) -> Box<dyn Iterator<Item = &Service> + '_> {
        let own = self.service_list.iter();
        let nested = self.device_list.iter().flat_map(|d| d.all_services());
        Box::new(own.chain(nested))
    }

    pub fn all_services_mut(&mut self) -> Box<dyn Iterator<Item = &mut Service> + '_> {
        let own = self.service_list.iter_mut();
        let nested = self.device_list.iter_mut().flat_map(|d| d.all_services_mut());
        Box::new(own.chain(nested))
    }

    pub fn find_service_mut(&mut self, service_id: &str) -> Option<&mut Service> {
        self.all_services_mut().find(|s| s.service_id == service_id)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.udn == other.udn
    }
}
impl Eq for Device {}

/// A functional interface exposed by a [`Device`].
#[derive(Debug, Clone)]
pub struct Service {
    pub service_type: String,
    pub service_id: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
    pub actions: Vec<Action>,
    pub state_variables: Vec<StateVariable>,
    pub subscription: SubscriptionState,
}

/// Zero value when unsubscribed; all four fields populate together on success.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionState {
    pub sid: Option<String>,
    pub start: Option<Instant>,
    pub timeout: Option<Duration>,
    pub expiry: Option<Instant>,
    pub keep_renew: bool,
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        self.sid.is_some()
    }

    pub fn clear(&mut self) {
        *self = SubscriptionState::default();
    }
}

impl Service {
    /// Returns the index of the state variable matching `name`, trimming
    /// whitespace and retrying once per the argument resolution policy.
    pub fn find_variable(&self, name: &str) -> Option<usize> {
        self.state_variables
            .iter()
            .position(|v| v.name == name)
            .or_else(|| {
                let trimmed = name.trim();
                (trimmed != name)
                    .then(|| self.state_variables.iter().position(|v| v.name == trimmed))
                    .flatten()
            })
    }

    pub fn find_action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.service_id == other.service_id
    }
}
impl Eq for Service {}
impl std::hash::Hash for Service {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.service_id.hash(state);
    }
}

/// A named operation on a [`Service`].
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub arguments: Vec<Argument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentDirection {
    In,
    Out,
}

impl std::str::FromStr for ArgumentDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            rest => Err(anyhow::anyhow!("unknown argument direction: {rest}")),
        }
    }
}

impl std::fmt::Display for ArgumentDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgumentDirection::In => write!(f, "in"),
            ArgumentDirection::Out => write!(f, "out"),
        }
    }
}

/// An argument belonging to an [`Action`]. `related_variable` is a non-owning
/// index into the parent [`Service`]'s `state_variables`, resolved once after
/// the whole SCPD document has been parsed.
#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub direction: ArgumentDirection,
    pub related_variable: usize,
}

#[derive(Debug, Clone)]
pub struct StateVariable {
    pub name: String,
    pub data_type: DataType,
    pub send_events: bool,
    pub allowed_list: Option<Vec<String>>,
    pub range: Option<Range>,
    pub default: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Icon {
    pub mimetype: String,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub url: String,
    /// Populated only when the configured icon filter selected this icon.
    pub data: Option<Vec<u8>>,
}
