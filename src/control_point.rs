//! The [`ControlPoint`] facade: wires together SSDP discovery, the device
//! loader, the device registry, the subscription manager and the event
//! receiver into the single object applications construct and call `start`
//! on (§4, §5, §9 "Factory / dependency injection").

use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    event_receiver::{EventListener, EventReceiver, EventReceiverState, MulticastEventReceiver, NotifyEventListener},
    loader::{no_icons, DeviceLoader, IconFilter},
    model,
    registry::DeviceHolder,
    ssdp::{self, InterfaceAddress, NotificationType, NotificationSubType, SearchMessage, SsdpEvent, SsdpReceiver},
    subscription::SubscriptionManager,
};

/// IPv4-only, IPv6-only, or both (§6 `protocol` option). This crate only
/// implements IPv4 SSDP sockets today; `IPv6Only`/`DualStack` are accepted
/// and recorded but behave like `IPv4Only` until IPv6 support lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    DualStack,
    IPv4Only,
    IPv6Only,
}

pub type SsdpFilter = Arc<dyn Fn(&ssdp::SsdpMessage) -> bool + Send + Sync>;

fn accept_all() -> SsdpFilter {
    Arc::new(|_| true)
}

/// Builder for [`ControlPoint`] construction options (§10.3).
#[derive(Clone)]
pub struct ControlPointConfig {
    interfaces: Option<Vec<InterfaceAddress>>,
    protocol: Protocol,
    notify_segment_check: bool,
    icon_filter: IconFilter,
    ssdp_filter: SsdpFilter,
    event_port: u16,
    search_mx: usize,
}

impl Default for ControlPointConfig {
    fn default() -> Self {
        Self {
            interfaces: None,
            protocol: Protocol::default(),
            notify_segment_check: true,
            icon_filter: no_icons(),
            ssdp_filter: accept_all(),
            event_port: 0,
            search_mx: 1,
        }
    }
}

impl ControlPointConfig {
    pub fn with_interfaces(mut self, interfaces: Vec<InterfaceAddress>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_notify_segment_check(mut self, enabled: bool) -> Self {
        self.notify_segment_check = enabled;
        self
    }

    pub fn with_icon_filter(mut self, filter: IconFilter) -> Self {
        self.icon_filter = filter;
        self
    }

    pub fn with_ssdp_filter(mut self, filter: SsdpFilter) -> Self {
        self.ssdp_filter = filter;
        self
    }

    pub fn with_event_port(mut self, port: u16) -> Self {
        self.event_port = port;
        self
    }

    pub fn with_search_mx(mut self, mx: usize) -> Self {
        self.search_mx = mx;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    NotStarted,
    Running,
    Stopped,
    Terminated,
}

/// Notified when a Device is added to or dropped from the registry, in causal
/// order with the SSDP messages that produced the change (§5 ordering
/// guarantee).
#[async_trait::async_trait]
pub trait DiscoveryListener: Send + Sync {
    async fn on_discover(&self, device: model::Device);
    async fn on_lost(&self, device: model::Device);
}

enum CallbackEvent {
    Discovered(model::Device),
    Lost(model::Device),
}

pub struct ControlPoint {
    config: ControlPointConfig,
    registry: Arc<DeviceHolder>,
    loader: Arc<DeviceLoader>,
    subscriptions: Arc<SubscriptionManager>,
    event_receiver_state: EventReceiverState,
    discovery_listeners: Arc<RwLock<Vec<Arc<dyn DiscoveryListener>>>>,
    receivers: Vec<Arc<SsdpReceiver>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    cancellation_token: CancellationToken,
    state: tokio::sync::Mutex<LifecycleState>,
    callback_tx: mpsc::Sender<CallbackEvent>,
}

impl ControlPoint {
    pub async fn new() -> Result<Arc<Self>> {
        Self::with_config(ControlPointConfig::default()).await
    }

    pub async fn with_config(config: ControlPointConfig) -> Result<Arc<Self>> {
        let http_client = reqwest::Client::new();
        let registry = DeviceHolder::new();
        let loader = DeviceLoader::new(http_client.clone());
        let event_port = bind_event_receiver(config.event_port).await?;
        let callback_url = format!("http://{}:{}/", local_ipv4(), event_port.1.port());
        let subscriptions = SubscriptionManager::new(registry.clone(), http_client, callback_url);
        let event_receiver_state = EventReceiverState::new(registry.clone());

        let interfaces = match &config.interfaces {
            Some(interfaces) => interfaces.clone(),
            None => ssdp::list_interfaces().map_err(|err| Error::network_with_source("enumerate network interfaces", err))?,
        };

        let mut receivers = Vec::new();
        let mut multicast_receivers = Vec::new();
        for interface in &interfaces {
            let notify = SsdpReceiver::bind_notify(interface.clone(), None)
                .map_err(|err| Error::network_with_source(format!("bind notify on {}", interface.name), err))?;
            let search = SsdpReceiver::bind_search(interface.clone())
                .map_err(|err| Error::network_with_source(format!("bind search on {}", interface.name), err))?;
            receivers.push(Arc::new(notify));
            receivers.push(Arc::new(search));

            match MulticastEventReceiver::bind(interface) {
                Ok(receiver) => multicast_receivers.push(receiver),
                Err(err) => tracing::warn!("failed to bind multicast event receiver on {}: {err:#}", interface.name),
            }
        }

        let (callback_tx, callback_rx) = mpsc::channel(256);

        let this = Arc::new(Self {
            config,
            registry,
            loader,
            subscriptions,
            event_receiver_state,
            discovery_listeners: Arc::new(RwLock::new(Vec::new())),
            receivers,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            cancellation_token: CancellationToken::new(),
            state: tokio::sync::Mutex::new(LifecycleState::NotStarted),
            callback_tx,
        });

        this.clone().spawn_callback_executor(callback_rx);
        this.spawn_event_receiver(event_port.0).await;
        for receiver in multicast_receivers {
            this.spawn_multicast_event_receiver(receiver).await;
        }

        Ok(this)
    }

    pub fn add_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        let mut guard = self.discovery_listeners.write().expect("listener lock poisoned");
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = next;
    }

    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.event_receiver_state.add_listener(listener);
    }

    pub fn add_multicast_event_listener(&self, listener: Arc<dyn NotifyEventListener>) {
        self.event_receiver_state.add_multicast_listener(listener);
    }

    /// Starts all receive loops and the expiry/renewal schedulers. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != LifecycleState::NotStarted {
            return Ok(());
        }

        let mut tasks = self.tasks.lock().await;
        let (discovered_tx, mut discovered_rx) = mpsc::channel::<ssdp::SsdpEvent>(256);

        for receiver in &self.receivers {
            let receiver = receiver.clone();
            let tx = discovered_tx.clone();
            let segment_check = self.config.notify_segment_check;
            let cancellation_token = self.cancellation_token.clone();
            tasks.spawn(async move {
                receiver.run(segment_check, tx, cancellation_token).await;
            });
        }
        for receiver in &self.receivers {
            receiver.wait_ready().await;
        }

        let this = self.clone();
        tasks.spawn(async move {
            while let Some(event) = discovered_rx.recv().await {
                this.handle_ssdp_event(event).await;
            }
        });

        let this = self.clone();
        let cancellation_token = self.cancellation_token.clone();
        tasks.spawn(async move {
            let (expired_tx, mut expired_rx) = mpsc::channel(64);
            let registry = this.registry.clone();
            let expiry_task = tokio::spawn(registry.run_expiry_task(expired_tx, cancellation_token));
            while let Some(device) = expired_rx.recv().await {
                this.subscriptions.unsubscribe_device(&device.udn).await;
                let _ = this.callback_tx.send(CallbackEvent::Lost(device)).await;
            }
            let _ = expiry_task.await;
        });

        let subscriptions = self.subscriptions.clone();
        let cancellation_token = self.cancellation_token.clone();
        tasks.spawn(subscriptions.run_renewal_task(cancellation_token));

        *state = LifecycleState::Running;
        Ok(())
    }

    /// Broadcasts an M-SEARCH on every interface (§4.2). `InvalidState`
    /// before `start`.
    pub async fn search(&self, target: Option<NotificationType>) -> Result<()> {
        if *self.state.lock().await != LifecycleState::Running {
            return Err(Error::invalid_state("search invoked before start"));
        }
        let message = SearchMessage {
            host: ssdp::SSDP_ADDR,
            st: target.unwrap_or(NotificationType::All),
            mx: self.config.search_mx,
            user_agent: None,
        };
        for receiver in self.receivers.iter().filter(|r| r.state() == ssdp::ReceiverState::Ready) {
            if let Err(err) = receiver.send_search(&message).await {
                tracing::warn!("failed to send M-SEARCH on {}: {err:#}", receiver.interface.name);
            }
        }
        Ok(())
    }

    pub async fn get_device(&self, udn: &str) -> Option<model::Device> {
        self.registry.get(udn).await
    }

    pub async fn list_devices(&self) -> Vec<model::Device> {
        self.registry.list().await
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Cancels server tasks, best-effort unsubscribes, then clears the
    /// registry. Idempotent.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != LifecycleState::Running {
            return Ok(());
        }
        self.cancellation_token.cancel();

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}

        self.subscriptions.shutdown().await;
        self.registry.clear().await;

        *state = LifecycleState::Stopped;
        Ok(())
    }

    /// Additionally shuts down the callback executor and releases the event
    /// port. Re-`start` after `terminate` is not supported.
    pub async fn terminate(self: &Arc<Self>) -> Result<()> {
        self.stop().await?;
        *self.state.lock().await = LifecycleState::Terminated;
        Ok(())
    }

    async fn handle_ssdp_event(self: &Arc<Self>, event: SsdpEvent) {
        let message = match event {
            SsdpEvent::Notify(message) | SsdpEvent::SearchResponse(message) => message,
        };
        if !(self.config.ssdp_filter)(&message) {
            return;
        }

        if message.nts == NotificationSubType::ByeBye {
            self.loader.cancel(&message.usn.udn).await;
            if let Some(device) = self.registry.remove(&message.usn.udn).await {
                self.subscriptions.unsubscribe_device(&device.udn).await;
                let _ = self.callback_tx.send(CallbackEvent::Lost(device)).await;
            }
            return;
        }

        let (tx, mut rx) = mpsc::channel(1);
        self.loader
            .handle_message(&self.registry, message, self.config.icon_filter.clone(), tx)
            .await;
        if let Some(device) = rx.recv().await {
            let _ = self.callback_tx.send(CallbackEvent::Discovered(device)).await;
        }
    }

    fn spawn_callback_executor(self: Arc<Self>, mut rx: mpsc::Receiver<CallbackEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let listeners = {
                    let guard = self.discovery_listeners.read().expect("listener lock poisoned");
                    Arc::new((*guard).clone())
                };
                match event {
                    CallbackEvent::Discovered(device) => {
                        for listener in listeners.iter() {
                            listener.on_discover(device.clone()).await;
                        }
                    }
                    CallbackEvent::Lost(device) => {
                        for listener in listeners.iter() {
                            listener.on_lost(device.clone()).await;
                        }
                    }
                }
            }
        });
    }

    async fn spawn_event_receiver(self: &Arc<Self>, receiver: EventReceiver) {
        let state = self.event_receiver_state.clone();
        let cancellation_token = self.cancellation_token.clone();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            receiver.serve(state, cancellation_token).await;
        });
    }

    async fn spawn_multicast_event_receiver(self: &Arc<Self>, receiver: MulticastEventReceiver) {
        let state = self.event_receiver_state.clone();
        let cancellation_token = self.cancellation_token.clone();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            receiver.run(state, cancellation_token).await;
        });
    }
}

async fn bind_event_receiver(preferred_port: u16) -> Result<(EventReceiver, std::net::SocketAddr)> {
    let receiver = EventReceiver::bind(preferred_port)
        .await
        .map_err(|err| Error::network_with_source("bind event receiver", err))?;
    let addr = receiver
        .local_addr()
        .map_err(|err| Error::network_with_source("read event receiver local addr", err))?;
    Ok((receiver, addr))
}

fn local_ipv4() -> Ipv4Addr {
    ssdp::list_interfaces()
        .ok()
        .and_then(|interfaces| interfaces.into_iter().next())
        .map(|interface| interface.addr)
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_chains() {
        let config = ControlPointConfig::default()
            .with_notify_segment_check(false)
            .with_search_mx(3)
            .with_event_port(5000);
        assert!(!config.notify_segment_check);
        assert_eq!(config.search_mx, 3);
        assert_eq!(config.event_port, 5000);
    }
}
