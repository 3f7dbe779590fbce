//! The device holder: the authoritative, in-memory UDN→Device map (§4.4).
//!
//! Grounded on the same monitor-plus-background-sweeper shape the donor uses
//! for its subscriber store, adapted from a device-side subscriber list to a
//! control-point device registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::{model, ssdp::SsdpMessage};

pub struct DeviceHolder {
    inner: Mutex<HashMap<String, model::Device>>,
    notify: Notify,
}

impl DeviceHolder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    pub async fn add(&self, device: model::Device) {
        let mut guard = self.inner.lock().await;
        guard.insert(device.udn.clone(), device);
        drop(guard);
        self.notify.notify_waiters();
    }

    /// If a Device keyed by `udn` already exists, refreshes its SsdpMessage
    /// and expiry and returns `true`. Otherwise returns `false` (§4.3 step 1).
    pub async fn refresh(&self, udn: &str, message: SsdpMessage, max_age: Duration) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(device) = guard.get_mut(udn) else {
            return false;
        };
        device.refresh(message, max_age);
        drop(guard);
        self.notify.notify_waiters();
        true
    }

    pub async fn remove(&self, udn: &str) -> Option<model::Device> {
        let removed = self.inner.lock().await.remove(udn);
        if removed.is_some() {
            self.notify.notify_waiters();
        }
        removed
    }

    pub async fn get(&self, udn: &str) -> Option<model::Device> {
        self.inner.lock().await.get(udn).cloned()
    }

    pub async fn list(&self) -> Vec<model::Device> {
        self.inner.lock().await.values().cloned().collect()
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn clear(&self) -> Vec<model::Device> {
        let mut guard = self.inner.lock().await;
        let all = guard.drain().map(|(_, d)| d).collect::<Vec<_>>();
        drop(guard);
        self.notify.notify_waiters();
        all
    }

    /// Runs `f` against the named Service with exclusive access, if both the
    /// Device and Service exist.
    pub async fn with_service_mut<R>(
        &self,
        udn: &str,
        service_id: &str,
        f: impl FnOnce(&mut model::Service) -> R,
    ) -> Option<R> {
        let mut guard = self.inner.lock().await;
        let device = guard.get_mut(udn)?;
        let service = device.find_service_mut(service_id)?;
        Some(f(service))
    }

    /// Finds the (udn, serviceId) pair whose active subscription carries `sid`.
    pub async fn find_by_sid(&self, sid: &str) -> Option<(String, String)> {
        let guard = self.inner.lock().await;
        for device in guard.values() {
            for service in device.all_services() {
                if service.subscription.sid.as_deref() == Some(sid) {
                    return Some((device.udn.clone(), service.service_id.clone()));
                }
            }
        }
        None
    }

    async fn sweep_expired(&self, now: Instant) -> Vec<model::Device> {
        let mut guard = self.inner.lock().await;
        let expired: Vec<String> = guard
            .iter()
            .filter(|(_, d)| d.is_expired(now))
            .map(|(udn, _)| udn.clone())
            .collect();
        expired.into_iter().filter_map(|udn| guard.remove(&udn)).collect()
    }

    /// Sleeps until the earliest expiry (or indefinitely while empty), wakes
    /// early on any mutation, and forwards every Device it sweeps so the
    /// caller can cascade the §4.4 unsubscribe-on-removal obligation.
    pub async fn run_expiry_task(
        self: Arc<Self>,
        expired_tx: tokio::sync::mpsc::Sender<model::Device>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            let deadline = self.inner.lock().await.values().map(|d| d.expiry).min();
            let sleep = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = sleep => {}
            }

            for device in self.sweep_expired(Instant::now()).await {
                if expired_tx.send(device).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{Device, Icon, Service, SubscriptionState},
        ssdp::{NotificationSubType, NotificationType, SsdpMessage, USN},
    };
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn sample_device(udn: &str) -> Device {
        Device {
            udn: udn.to_string(),
            device_type: "urn:schemas-upnp-org:device:MediaServer:1".into(),
            friendly_name: "Test".into(),
            manufacturer: "Acme".into(),
            model_name: "Box".into(),
            model_description: None,
            model_number: None,
            model_url: None,
            manufacturer_url: None,
            serial_number: None,
            presentation_url: None,
            base_url: "http://192.0.2.2:12345/".parse().unwrap(),
            remote_addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
            icon_list: Vec::<Icon>::new(),
            device_list: Vec::new(),
            service_list: vec![Service {
                service_type: "urn:schemas-upnp-org:service:ContentDirectory:1".into(),
                service_id: "urn:upnp-org:serviceId:ContentDirectory".into(),
                scpd_url: "/cd.xml".into(),
                control_url: "/cd/control".into(),
                event_sub_url: "/cd/event".into(),
                actions: Vec::new(),
                state_variables: Vec::new(),
                subscription: SubscriptionState::default(),
            }],
            ssdp_message: SsdpMessage {
                usn: USN::device_uuid(udn.to_string()),
                nt: NotificationType::RootDevice,
                nts: NotificationSubType::Alive,
                location: Some("http://192.0.2.2:12345/device.xml".into()),
                server: None,
                max_age: Some(1800),
                source: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)), 1900),
            },
            expiry: Instant::now() + Duration::from_secs(1800),
        }
    }

    #[test_log::test(tokio::test)]
    async fn add_get_remove_round_trip() {
        let holder = DeviceHolder::new();
        holder.add(sample_device("uuid:a")).await;
        assert_eq!(holder.size().await, 1);
        assert!(holder.get("uuid:a").await.is_some());
        let removed = holder.remove("uuid:a").await;
        assert!(removed.is_some());
        assert_eq!(holder.size().await, 0);
    }

    #[test_log::test(tokio::test)]
    async fn refresh_only_updates_existing() {
        let holder = DeviceHolder::new();
        let device = sample_device("uuid:a");
        let message = device.ssdp_message.clone();
        assert!(!holder.refresh("uuid:a", message.clone(), Duration::from_secs(60)).await);
        holder.add(device).await;
        assert!(holder.refresh("uuid:a", message, Duration::from_secs(60)).await);
    }

    #[test_log::test(tokio::test)]
    async fn with_service_mut_targets_the_right_service() {
        let holder = DeviceHolder::new();
        holder.add(sample_device("uuid:a")).await;
        let id = holder
            .with_service_mut("uuid:a", "urn:upnp-org:serviceId:ContentDirectory", |s| {
                s.subscription.sid = Some("sid-1".into());
                s.service_id.clone()
            })
            .await;
        assert_eq!(id.as_deref(), Some("urn:upnp-org:serviceId:ContentDirectory"));
        let found = holder.find_by_sid("sid-1").await;
        assert_eq!(found, Some(("uuid:a".to_string(), "urn:upnp-org:serviceId:ContentDirectory".to_string())));
    }
}
