//! The change notification engine: one LISTEN connection fanned out to
//! many bounded subscriber queues.
//!
//! The reading loop is started by the first subscription and stopped when
//! the last one goes away. Delivery never blocks: a full queue loses the
//! event for that subscriber only.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use searchgate_storage::{NotificationConnection, NotificationSource, DEFAULT_NOTIFICATION_CHANNEL};

use super::error::{NotificationError, NotificationResult};
use super::event::ChangeEvent;
use super::filter::SubscriptionFilter;
use super::gate::EventGate;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub channel: String,
    /// Reconnect attempts before the engine gives up.
    pub max_retries: u32,
    pub reconnect_delay: Duration,
    /// Capacity of each subscriber's delivery queue.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_NOTIFICATION_CHANNEL.to_string(),
            max_retries: 5,
            reconnect_delay: Duration::from_secs(1),
            queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    Connected,
    Listening,
    Delivering,
    Reconnecting,
    /// Reconnecting gave up, or the engine was shut down.
    Stopped,
}

/// A registered subscriber's event stream.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    filter: SubscriptionFilter,
    created_at: DateTime<Utc>,
    events: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Next event, or `None` once the subscription has been closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Result<ChangeEvent, TryRecvError> {
        self.events.try_recv()
    }

    pub fn into_receiver(self) -> mpsc::Receiver<ChangeEvent> {
        self.events
    }
}

/// Summary of a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub filter: SubscriptionFilter,
    pub created_at: DateTime<Utc>,
}

struct Subscriber {
    filter: SubscriptionFilter,
    created_at: DateTime<Utc>,
    queue: mpsc::Sender<ChangeEvent>,
}

struct Running {
    generation: u64,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
}

impl Lifecycle {
    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Signals the listener to stop. Returns false when none was registered.
    fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        running.stop.send_replace(true);
        debug!(generation = running.generation, "stopping notification listener");
        true
    }
}

struct Inner {
    source: Arc<dyn NotificationSource>,
    config: EngineConfig,
    subscribers: DashMap<String, Subscriber>,
    /// Serializes start, stop and registration.
    lifecycle: Mutex<Lifecycle>,
    generation: AtomicU64,
    state: watch::Sender<EngineState>,
}

enum Reconnect {
    Connected(Box<dyn NotificationConnection>),
    Stopped,
    GaveUp,
}

/// Fans store change notifications out to filtered subscriber queues.
#[derive(Clone)]
pub struct NotificationEngine {
    inner: Arc<Inner>,
}

impl NotificationEngine {
    pub fn new(source: Arc<dyn NotificationSource>, config: EngineConfig) -> Self {
        let (state, _) = watch::channel(EngineState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                subscribers: DashMap::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
                generation: AtomicU64::new(0),
                state,
            }),
        }
    }

    /// A fresh random subscription id.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut list: Vec<SubscriptionInfo> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| SubscriptionInfo {
                id: entry.key().clone(),
                filter: entry.filter.clone(),
                created_at: entry.created_at,
            })
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn is_listening(&self) -> bool {
        self.inner.lifecycle.lock().await.is_running()
    }

    /// Registers a subscriber, starting the listener if none is running.
    ///
    /// Fails with [`NotificationError::Connect`] when the listen connection
    /// cannot be opened, so callers never hold a stream that stays silent.
    #[instrument(skip(self, filter), fields(filter = %filter))]
    pub async fn subscribe(
        &self,
        id: impl Into<String> + std::fmt::Debug,
        filter: SubscriptionFilter,
    ) -> NotificationResult<Subscription> {
        filter.validate()?;
        let id = id.into();

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.subscribers.contains_key(&id) {
            return Err(NotificationError::Duplicate { id });
        }
        if !lifecycle.is_running() {
            self.inner.start(&mut lifecycle).await?;
        }

        let (queue, events) = mpsc::channel(self.inner.config.queue_capacity);
        let created_at = Utc::now();
        self.inner.subscribers.insert(
            id.clone(),
            Subscriber {
                filter: filter.clone(),
                created_at,
                queue,
            },
        );
        drop(lifecycle);

        info!(subscription = %id, "subscription registered");
        Ok(Subscription {
            id,
            filter,
            created_at,
            events,
        })
    }

    /// Like [`subscribe`](Self::subscribe), but every event must also pass `gate`.
    ///
    /// The gate runs in a forwarding task so the reading loop never waits on an
    /// authorization check. Events the gate is slow to clear back up in the
    /// subscriber's raw queue and are dropped there when it fills.
    pub async fn subscribe_with_gate(
        &self,
        id: impl Into<String> + std::fmt::Debug,
        filter: SubscriptionFilter,
        gate: Arc<dyn EventGate>,
    ) -> NotificationResult<Subscription> {
        let raw = self.subscribe(id, filter).await?;
        let (forward, events) = mpsc::channel(self.inner.config.queue_capacity);
        let id = raw.id.clone();
        let filter = raw.filter.clone();
        let created_at = raw.created_at;

        tokio::spawn(forward_gated(self.inner.clone(), raw, gate, forward));

        Ok(Subscription {
            id,
            filter,
            created_at,
            events,
        })
    }

    /// Removes a subscriber and closes its queue. Unknown ids are ignored.
    ///
    /// Returns whether the subscription existed. Removing the last
    /// subscription stops the listener.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let removed = self.inner.subscribers.remove(id).is_some();
        if removed {
            info!(subscription = %id, "subscription removed");
        } else {
            debug!(subscription = %id, "unsubscribe for unknown subscription");
        }
        if self.inner.subscribers.is_empty() && lifecycle.stop() {
            self.inner.publish_state(EngineState::Disconnected);
        }
        removed
    }

    /// Stops the listener and closes every subscription.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let _ = lifecycle.stop();
        let closed = self.inner.subscribers.len();
        self.inner.subscribers.clear();
        self.inner.publish_state(EngineState::Stopped);
        info!(closed, "notification engine shut down");
    }
}

impl Inner {
    async fn start(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> NotificationResult<()> {
        let connection = self
            .source
            .connect(&self.config.channel)
            .await
            .map_err(|e| {
                warn!(channel = %self.config.channel, error = %e, "could not start listening");
                NotificationError::Connect {
                    message: e.to_string(),
                }
            })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish_state(EngineState::Connected);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.clone().listen(connection, stop_rx, generation));
        lifecycle.running = Some(Running {
            generation,
            stop,
            task,
        });
        info!(channel = %self.config.channel, generation, "notification listener started");
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish_state(&self, state: EngineState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn publish_state_for(&self, generation: u64, state: EngineState) {
        if self.is_current(generation) {
            self.publish_state(state);
        }
    }

    async fn listen(
        self: Arc<Self>,
        mut connection: Box<dyn NotificationConnection>,
        mut stop: watch::Receiver<bool>,
        generation: u64,
    ) {
        self.publish_state_for(generation, EngineState::Listening);
        let mut retries = 0u32;

        loop {
            let received = tokio::select! {
                biased;
                _ = stopped(&mut stop) => {
                    connection.close().await;
                    debug!(generation, "notification listener stopped");
                    return;
                }
                received = connection.recv() => received,
            };

            match received {
                Ok(notification) => {
                    retries = 0;
                    self.dispatch(generation, &notification.payload);
                }
                Err(e) => {
                    warn!(error = %e, "notification connection failed");
                    connection.close().await;
                    self.publish_state_for(generation, EngineState::Reconnecting);

                    match self.reconnect(&mut stop, &mut retries).await {
                        Reconnect::Connected(fresh) => {
                            connection = fresh;
                            self.publish_state_for(generation, EngineState::Listening);
                        }
                        Reconnect::Stopped => return,
                        Reconnect::GaveUp => {
                            self.give_up(generation).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn reconnect(&self, stop: &mut watch::Receiver<bool>, retries: &mut u32) -> Reconnect {
        loop {
            *retries += 1;
            if *retries > self.config.max_retries {
                return Reconnect::GaveUp;
            }

            tokio::select! {
                biased;
                _ = stopped(stop) => return Reconnect::Stopped,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }

            metrics::counter!("searchgate_notification_reconnects_total").increment(1);
            let attempt = tokio::select! {
                biased;
                _ = stopped(stop) => return Reconnect::Stopped,
                attempt = self.source.connect(&self.config.channel) => attempt,
            };
            match attempt {
                Ok(connection) => {
                    info!(attempt = *retries, "notification listener reconnected");
                    return Reconnect::Connected(connection);
                }
                Err(e) => {
                    warn!(attempt = *retries, max = self.config.max_retries, error = %e, "reconnect failed");
                }
            }
        }
    }

    /// Closes every queue so streams end instead of going silent.
    async fn give_up(&self, generation: u64) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.is_current(generation) {
            return;
        }
        lifecycle.running = None;
        let closed = self.subscribers.len();
        self.subscribers.clear();
        self.publish_state(EngineState::Stopped);
        error!(
            retries = self.config.max_retries,
            closed, "notification listener gave up reconnecting; live updates are unavailable"
        );
    }

    fn dispatch(self: &Arc<Self>, generation: u64, payload: &str) {
        metrics::counter!("searchgate_notifications_received_total").increment(1);
        let event = match ChangeEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!("searchgate_notifications_malformed_total").increment(1);
                warn!(error = %e, payload_len = payload.len(), "dropping malformed notification");
                return;
            }
        };

        self.publish_state_for(generation, EngineState::Delivering);
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.filter.matches(&event) {
                continue;
            }
            match entry.queue.try_send(event.clone()) {
                Ok(()) => {
                    metrics::counter!("searchgate_notifications_delivered_total").increment(1);
                }
                Err(TrySendError::Full(_)) => {
                    metrics::counter!("searchgate_notifications_dropped_total", "reason" => "queue_full")
                        .increment(1);
                    warn!(subscription = %entry.key(), uid = %event.uid, "subscriber queue full; dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }
        self.publish_state_for(generation, EngineState::Listening);

        if closed.is_empty() {
            return;
        }
        for id in &closed {
            self.subscribers.remove(id);
            debug!(subscription = %id, "removed subscription with a dropped receiver");
        }
        if self.subscribers.is_empty() {
            tokio::spawn(self.clone().stop_if_idle());
        }
    }

    /// Removes `id` only if its receiver is gone, so a newer subscription
    /// reusing the id is left alone.
    async fn prune_closed(&self, id: &str) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self
            .subscribers
            .remove_if(id, |_, subscriber| subscriber.queue.is_closed())
            .is_some()
        {
            debug!(subscription = %id, "removed subscription with a dropped receiver");
        }
        if self.subscribers.is_empty() && lifecycle.stop() {
            self.publish_state(EngineState::Disconnected);
        }
    }

    async fn stop_if_idle(self: Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.subscribers.is_empty() && lifecycle.stop() {
            self.publish_state(EngineState::Disconnected);
        }
    }
}

async fn forward_gated(
    inner: Arc<Inner>,
    mut raw: Subscription,
    gate: Arc<dyn EventGate>,
    forward: mpsc::Sender<ChangeEvent>,
) {
    let consumer_gone = loop {
        let event = tokio::select! {
            event = raw.recv() => match event {
                Some(event) => event,
                None => break false,
            },
            () = forward.closed() => break true,
        };
        if !gate.allows(&event).await {
            metrics::counter!("searchgate_notifications_dropped_total", "reason" => "forbidden")
                .increment(1);
            continue;
        }
        match forward.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!("searchgate_notifications_dropped_total", "reason" => "queue_full")
                    .increment(1);
                warn!(subscription = %raw.id, "subscriber queue full; dropping event");
            }
            Err(TrySendError::Closed(_)) => break true,
        }
    };

    let Subscription { id, events, .. } = raw;
    drop(events);
    if consumer_gone {
        inner.prune_closed(&id).await;
    }
    debug!(subscription = %id, consumer_gone, "gated forwarding ended");
}

/// Resolves once the stop flag is set or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
