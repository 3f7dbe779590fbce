//! GENA subscription management (§4.5): SUBSCRIBE/RENEW/UNSUBSCRIBE against a
//! service's event sub URL, plus a background renewal scheduler.
//!
//! The donor's own `eventing` module only ever answered SUBSCRIBE requests
//! (device-side); this issues them, reusing its header names and the
//! general reqwest-client-as-collaborator shape used throughout the crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::{error::Error, registry::DeviceHolder};

const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// How far ahead of expiry the renewal scheduler wakes to renew a subscription.
const RENEWAL_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Tracked {
    udn: String,
    service_id: String,
    keep_renew: bool,
    expiry: tokio::time::Instant,
}

/// Owns every outstanding subscription this control point holds, keyed by SID.
pub struct SubscriptionManager {
    registry: Arc<DeviceHolder>,
    client: reqwest::Client,
    callback_url: String,
    tracked: Mutex<HashMap<String, Tracked>>,
    notify: Notify,
}

impl SubscriptionManager {
    pub fn new(registry: Arc<DeviceHolder>, client: reqwest::Client, callback_url: String) -> Arc<Self> {
        Arc::new(Self {
            registry,
            client,
            callback_url,
            tracked: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Issues a SUBSCRIBE for `service_id` on `udn`'s event sub URL. If the
    /// Service already carries an active subscription, renews it in place
    /// instead (§4.5: "if already Active, renew in place"), leaving the SID
    /// unchanged. On a fresh subscribe, success records the resulting SID on
    /// the Service and tracks it for renewal when `keep_renew` is set.
    pub async fn subscribe(&self, udn: &str, service_id: &str, keep_renew: bool) -> crate::error::Result<String> {
        let service = self
            .registry
            .get(udn)
            .await
            .and_then(|d| d.all_services().find(|s| s.service_id == service_id).cloned())
            .ok_or_else(|| Error::not_found(format!("no service {service_id} on device {udn}")))?;

        if let Some(sid) = service.subscription.sid.clone().filter(|_| service.subscription.is_active()) {
            self.renew_by_service(udn, service_id, &sid).await?;
            self.registry
                .with_service_mut(udn, service_id, |service| service.subscription.keep_renew = keep_renew)
                .await;
            if let Some(tracked) = self.tracked.lock().await.get_mut(&sid) {
                tracked.keep_renew = keep_renew;
            }
            return Ok(sid);
        }

        let event_sub_url = service.event_sub_url;

        let method = reqwest::Method::from_bytes(b"SUBSCRIBE").expect("SUBSCRIBE is a valid HTTP method token");
        let response = self
            .client
            .request(method, &event_sub_url)
            .header("CALLBACK", format!("<{}>", self.callback_url))
            .header("NT", "upnp:event")
            .header("TIMEOUT", format!("Second-{DEFAULT_TIMEOUT_SECS}"))
            .send()
            .await?;
        let response = response.error_for_status()?;
        let headers = response.headers().clone();

        let sid = header_str(&headers, "SID")
            .ok_or_else(|| Error::protocol("SUBSCRIBE response missing SID"))?
            .to_string();
        let timeout = parse_timeout(header_str(&headers, "TIMEOUT"));
        let expiry = tokio::time::Instant::now() + timeout;

        self.registry
            .with_service_mut(udn, service_id, |service| {
                service.subscription.sid = Some(sid.clone());
                service.subscription.start = Some(std::time::Instant::now());
                service.subscription.timeout = Some(timeout);
                service.subscription.expiry = Some(expiry.into_std());
                service.subscription.keep_renew = keep_renew;
            })
            .await
            .ok_or_else(|| Error::not_found(format!("no service {service_id} on device {udn}")))?;

        self.tracked.lock().await.insert(
            sid.clone(),
            Tracked {
                udn: udn.to_string(),
                service_id: service_id.to_string(),
                keep_renew,
                expiry,
            },
        );
        self.notify.notify_waiters();

        Ok(sid)
    }

    /// Renews an existing subscription by SID, per §4.5's RENEW semantics
    /// (no CALLBACK/NT on a renewal, same SID comes back).
    pub async fn renew(&self, sid: &str) -> crate::error::Result<()> {
        let Some((udn, service_id)) = self.registry.find_by_sid(sid).await else {
            return Err(Error::not_found(format!("no active subscription with sid {sid}")));
        };
        self.renew_by_service(&udn, &service_id, sid).await
    }

    async fn renew_by_service(&self, udn: &str, service_id: &str, sid: &str) -> crate::error::Result<()> {
        let event_sub_url = self
            .registry
            .get(udn)
            .await
            .and_then(|d| d.all_services().find(|s| s.service_id == service_id).map(|s| s.event_sub_url.clone()))
            .ok_or_else(|| Error::not_found(format!("no service {service_id} on device {udn}")))?;

        let response = self
            .client
            .request(reqwest::Method::from_bytes(b"SUBSCRIBE").expect("valid"), &event_sub_url)
            .header("SID", sid)
            .header("TIMEOUT", format!("Second-{DEFAULT_TIMEOUT_SECS}"))
            .send()
            .await?;
        let response = response.error_for_status()?;
        let timeout = parse_timeout(header_str(response.headers(), "TIMEOUT"));
        let expiry = tokio::time::Instant::now() + timeout;

        self.registry
            .with_service_mut(udn, service_id, |service| {
                service.subscription.timeout = Some(timeout);
                service.subscription.expiry = Some(expiry.into_std());
            })
            .await;

        if let Some(tracked) = self.tracked.lock().await.get_mut(sid) {
            tracked.expiry = expiry;
        }
        self.notify.notify_waiters();

        Ok(())
    }

    pub async fn unsubscribe(&self, sid: &str) -> crate::error::Result<()> {
        let Some((udn, service_id)) = self.registry.find_by_sid(sid).await else {
            return Ok(());
        };
        self.unsubscribe_inner(&udn, &service_id, sid).await
    }

    /// Unsubscribes every active subscription belonging to `udn` — used when
    /// a device is removed from the registry (§4.4/§4.5 cascade).
    pub async fn unsubscribe_device(&self, udn: &str) {
        let Some(device) = self.registry.get(udn).await else {
            return;
        };
        for service in device.all_services() {
            if let Some(sid) = service.subscription.sid.clone() {
                if let Err(err) = self.unsubscribe_inner(udn, &service.service_id, &sid).await {
                    tracing::warn!("failed to unsubscribe {sid} on removal of {udn}: {err}");
                }
            }
        }
    }

    async fn unsubscribe_inner(&self, udn: &str, service_id: &str, sid: &str) -> crate::error::Result<()> {
        let event_sub_url = self
            .registry
            .get(udn)
            .await
            .and_then(|d| d.all_services().find(|s| s.service_id == service_id).map(|s| s.event_sub_url.clone()));

        self.tracked.lock().await.remove(sid);
        self.registry
            .with_service_mut(udn, service_id, |service| service.subscription.clear())
            .await;

        let Some(event_sub_url) = event_sub_url else {
            return Ok(());
        };
        let method = reqwest::Method::from_bytes(b"UNSUBSCRIBE").expect("UNSUBSCRIBE is a valid HTTP method token");
        let response = self.client.request(method, &event_sub_url).header("SID", sid).send().await?;
        response.error_for_status()?;
        Ok(())
    }

    /// Unsubscribes everything this manager is tracking, for orderly shutdown.
    pub async fn shutdown(&self) {
        let sids: Vec<String> = self.tracked.lock().await.keys().cloned().collect();
        for sid in sids {
            if let Err(err) = self.unsubscribe(&sid).await {
                tracing::warn!("failed to unsubscribe {sid} during shutdown: {err}");
            }
        }
    }

    /// Wakes at the earliest expiry minus a safety margin and renews every
    /// `keep_renew` subscription due; others are left to lapse silently,
    /// matching §4.5's "renew only what was asked to be kept alive" rule.
    pub async fn run_renewal_task(self: Arc<Self>, cancellation_token: CancellationToken) {
        loop {
            let deadline = self
                .tracked
                .lock()
                .await
                .values()
                .filter(|t| t.keep_renew)
                .map(|t| t.expiry)
                .min();

            let sleep = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.checked_sub(RENEWAL_MARGIN).unwrap_or(deadline)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancellation_token.cancelled() => return,
                _ = self.notify.notified() => continue,
                _ = sleep => {}
            }

            let due: Vec<(String, String, String)> = self
                .tracked
                .lock()
                .await
                .iter()
                .filter(|(_, t)| t.keep_renew && t.expiry.checked_duration_since(tokio::time::Instant::now()).map_or(true, |d| d <= RENEWAL_MARGIN))
                .map(|(sid, t)| (sid.clone(), t.udn.clone(), t.service_id.clone()))
                .collect();

            for (sid, udn, service_id) in due {
                if let Err(err) = self.renew_by_service(&udn, &service_id, &sid).await {
                    tracing::warn!("failed to renew subscription {sid}: {err}");
                }
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap<HeaderValue>, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

/// Parses a GENA TIMEOUT header value per §8's boundary behaviour: `Second-<n>`
/// carries through (case-insensitively, per §4.5), `infinite` and anything
/// malformed or absent fall back to the default.
fn parse_timeout(value: Option<&str>) -> Duration {
    let Some(value) = value else {
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    };
    let lower = value.to_ascii_lowercase();
    match lower.strip_prefix("second-") {
        Some(seconds) => seconds
            .parse()
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_handles_boundary_values() {
        assert_eq!(parse_timeout(Some("Second-120")), Duration::from_secs(120));
        assert_eq!(parse_timeout(Some("second-120")), Duration::from_secs(120));
        assert_eq!(parse_timeout(Some("SECOND-120")), Duration::from_secs(120));
        assert_eq!(parse_timeout(Some("infinite")), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(parse_timeout(Some("garbage")), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(parse_timeout(None), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }
}
