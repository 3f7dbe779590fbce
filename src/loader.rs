//! The device loader pipeline (§4.3): turns a validated SSDP announcement
//! into a fully resolved [`model::Device`], deduplicating concurrent loads of
//! the same UUID the way the donor's search client deduplicates in-flight
//! `JoinSet` fetches, but keyed by UDN with an explicit loading map instead
//! of a bounded join window.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;

use crate::{
    description::{DeviceDescriptionXml, DeviceXml, IconXml, ServiceXml},
    model,
    registry::DeviceHolder,
    scpd::ScpdXml,
    ssdp::SsdpMessage,
    FromXml,
};

/// Selects which of a device's icons should have their binary downloaded.
/// Default (see §6) is to select none.
pub type IconFilter = Arc<dyn Fn(&[model::Icon]) -> Vec<usize> + Send + Sync>;

pub fn no_icons() -> IconFilter {
    Arc::new(|_icons| Vec::new())
}

#[derive(Debug, Clone)]
struct LoadingEntry {
    message: Arc<Mutex<SsdpMessage>>,
}

pub struct DeviceLoader {
    client: reqwest::Client,
    loading: Mutex<HashMap<String, LoadingEntry>>,
}

impl DeviceLoader {
    pub fn new(client: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            client,
            loading: Mutex::new(HashMap::new()),
        })
    }

    /// Runs the three-stage pipeline of §4.3 for one accepted SSDP message.
    /// On a completed new load, sends the built Device to `discovered`.
    pub async fn handle_message(
        self: &Arc<Self>,
        registry: &Arc<DeviceHolder>,
        message: SsdpMessage,
        icon_filter: IconFilter,
        discovered: tokio::sync::mpsc::Sender<model::Device>,
    ) {
        let udn = message.usn.udn.clone();
        let max_age = Duration::from_secs(message.max_age.unwrap_or(1800));

        if registry.refresh(&udn, message.clone(), max_age).await {
            return;
        }

        {
            let mut loading = self.loading.lock().await;
            if let Some(entry) = loading.get(&udn) {
                *entry.message.lock().await = message;
                return;
            }
            loading.insert(
                udn.clone(),
                LoadingEntry {
                    message: Arc::new(Mutex::new(message)),
                },
            );
        }

        let this = self.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let result = this.load(&udn, icon_filter).await;
            this.loading.lock().await.remove(&udn);
            match result {
                Ok(device) => {
                    registry.add(device.clone()).await;
                    let _ = discovered.send(device).await;
                }
                Err(err) => {
                    tracing::warn!("failed to load device {udn}: {err:#}");
                }
            }
        });
    }

    /// Removes `udn` from the loading map without building anything, for
    /// byebye arriving mid-load (§8 S2).
    pub async fn cancel(&self, udn: &str) {
        self.loading.lock().await.remove(udn);
    }

    async fn load(&self, udn: &str, icon_filter: IconFilter) -> anyhow::Result<model::Device> {
        let message = {
            let loading = self.loading.lock().await;
            let entry = loading.get(udn).context("load cancelled before it started")?;
            entry.message.lock().await.clone()
        };
        let location = message.location.clone().context("NOTIFY missing LOCATION")?;

        let description_xml = fetch_text(&self.client, &location).await?;
        let parsed = DeviceDescriptionXml::read_xml(&mut quick_xml::Reader::from_str(&description_xml))
            .context("parse device description")?;
        let base_url = reqwest::Url::parse(&location).context("parse LOCATION as url")?;
        let max_age = Duration::from_secs(message.max_age.unwrap_or(1800));

        build_device(&self.client, &base_url, parsed.device, message, max_age, &icon_filter).await
    }
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let response = client.get(url).send().await.context("fetch url")?;
    let response = response.error_for_status().context("non-success status")?;
    response.text().await.context("read response body")
}

async fn fetch_bytes(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<u8>> {
    let response = client.get(url).send().await.context("fetch url")?;
    let response = response.error_for_status().context("non-success status")?;
    Ok(response.bytes().await.context("read response body")?.to_vec())
}

/// Recurses into `deviceList`; boxed because `async fn` can't be directly
/// recursive.
fn build_device<'a>(
    client: &'a reqwest::Client,
    base_url: &'a reqwest::Url,
    raw: DeviceXml,
    message: SsdpMessage,
    max_age: Duration,
    icon_filter: &'a IconFilter,
) -> Pin<Box<dyn Future<Output = anyhow::Result<model::Device>> + Send + 'a>> {
    Box::pin(async move {
        let mut service_list = Vec::with_capacity(raw.service_list.len());
        for service in raw.service_list {
            service_list.push(build_service(client, base_url, service).await?);
        }

        let mut device_list = Vec::with_capacity(raw.device_list.len());
        for child in raw.device_list {
            device_list.push(
                build_device(client, base_url, child, message.clone(), max_age, icon_filter).await?,
            );
        }

        let mut icon_list: Vec<model::Icon> = raw
            .icon_list
            .into_iter()
            .map(|icon: IconXml| model::Icon {
                mimetype: icon.mimetype,
                width: icon.width,
                height: icon.height,
                depth: icon.depth,
                url: icon.url,
                data: None,
            })
            .collect();

        for index in icon_filter(&icon_list) {
            let Some(icon) = icon_list.get_mut(index) else {
                continue;
            };
            let url = base_url
                .join(&icon.url)
                .with_context(|| format!("resolve icon url {}", icon.url))?;
            match fetch_bytes(client, url.as_str()).await {
                Ok(bytes) => icon.data = Some(bytes),
                Err(err) => tracing::warn!("failed to download icon {}: {err:#}", icon.url),
            }
        }

        Ok(model::Device {
            udn: raw.udn,
            device_type: raw.device_type,
            friendly_name: raw.friendly_name,
            manufacturer: raw.manufacturer,
            model_name: raw.model_name,
            model_description: raw.model_description,
            model_number: raw.model_number,
            model_url: raw.model_url,
            manufacturer_url: raw.manufacturer_url,
            serial_number: raw.serial_number,
            presentation_url: raw.presentation_url,
            base_url: base_url.clone(),
            remote_addr: message.source.ip(),
            icon_list,
            device_list,
            service_list,
            ssdp_message: message,
            expiry: std::time::Instant::now() + max_age,
        })
    })
}

async fn build_service(
    client: &reqwest::Client,
    base_url: &reqwest::Url,
    raw: ServiceXml,
) -> anyhow::Result<model::Service> {
    let scpd_url = base_url
        .join(&raw.scpd_url)
        .with_context(|| format!("resolve scpd url {}", raw.scpd_url))?;
    let scpd_xml = fetch_text(client, scpd_url.as_str()).await?;
    let scpd = ScpdXml::read_xml(&mut quick_xml::Reader::from_str(&scpd_xml))
        .with_context(|| format!("parse scpd for service {}", raw.service_id))?;

    let state_variables: Vec<model::StateVariable> = scpd
        .state_variables
        .into_iter()
        .map(|v| model::StateVariable {
            name: v.name,
            data_type: v.data_type,
            send_events: v.send_events,
            allowed_list: v.allowed_list,
            range: v.range,
            default: v.default,
        })
        .collect();

    let mut actions = Vec::with_capacity(scpd.actions.len());
    for action in scpd.actions {
        let mut arguments = Vec::with_capacity(action.arguments.len());
        for argument in action.arguments {
            let related_variable = resolve_related_variable(&state_variables, &argument.related_state_variable)
                .with_context(|| {
                    format!(
                        "resolve relatedStateVariable {:?} for argument {} of action {}",
                        argument.related_state_variable, argument.name, action.name
                    )
                })?;
            arguments.push(model::Argument {
                name: argument.name,
                direction: argument.direction,
                related_variable,
            });
        }
        actions.push(model::Action {
            name: action.name,
            arguments,
        });
    }

    Ok(model::Service {
        service_type: raw.service_type,
        service_id: raw.service_id,
        scpd_url: raw.scpd_url,
        control_url: raw.control_url,
        event_sub_url: raw.event_sub_url,
        actions,
        state_variables,
        subscription: model::SubscriptionState::default(),
    })
}

/// §4.3 argument resolution policy: exact match first, then trimmed-once retry.
fn resolve_related_variable(variables: &[model::StateVariable], name: &str) -> anyhow::Result<usize> {
    if let Some(index) = variables.iter().position(|v| v.name == name) {
        return Ok(index);
    }
    let trimmed = name.trim();
    if trimmed != name {
        if let Some(index) = variables.iter().position(|v| v.name == trimmed) {
            tracing::warn!("relatedStateVariable {name:?} matched only after trimming whitespace");
            return Ok(index);
        }
    }
    anyhow::bail!("no state variable named {name:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_variable_resolves_with_trim_retry() {
        let variables = vec![model::StateVariable {
            name: "Volume".to_string(),
            data_type: crate::service_variables::DataType::Ui2,
            send_events: true,
            allowed_list: None,
            range: None,
            default: None,
        }];
        assert_eq!(resolve_related_variable(&variables, "Volume").unwrap(), 0);
        assert_eq!(resolve_related_variable(&variables, "  Volume  ").unwrap(), 0);
        assert!(resolve_related_variable(&variables, "Unknown").is_err());
    }
}
