//! Background task keeping one interest current.
//!
//! The driver walks the [`SyncState`] machine: it tries push when the
//! interest is eligible, falls back to polling on timeout or disconnect,
//! backs off after failed polls and periodically retries push.

use std::sync::Arc;

use chrono::Utc;
use reflex_core::{
    ChangeEvent, Interest, InterestKey, Model, PushMessage, Timestamp, TransportError,
    UpdateSource,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::PushSubscription;
use crate::metrics::CacheMetrics;
use crate::transport::TransportCoordinator;

use super::state::SyncState;

/// Control side of a running driver.
#[derive(Debug)]
pub struct DriverHandle {
    stop: watch::Sender<bool>,
    retune: watch::Sender<()>,
    state: watch::Receiver<SyncState>,
}

impl DriverHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Ask the driver to re-derive its sync policy.
    pub fn retune(&self) {
        self.retune.send_replace(());
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        *self.stop.borrow() || matches!(*self.state.borrow(), SyncState::Stopped)
    }
}

pub struct SyncDriver<M: Model> {
    coordinator: Arc<TransportCoordinator<M>>,
    interest: Interest<M::Id>,
    key: InterestKey<M::Id>,
    stop: watch::Receiver<bool>,
    retune: watch::Receiver<()>,
    state_tx: watch::Sender<SyncState>,
    subscription: Option<PushSubscription<M>>,
    activated: Option<Timestamp>,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped handle also stops the driver.
    let _ = stop.wait_for(|stop| *stop).await;
}

impl<M: Model> SyncDriver<M> {
    pub fn new(coordinator: Arc<TransportCoordinator<M>>, interest: Interest<M::Id>) -> (DriverHandle, Self) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (retune_tx, retune_rx) = watch::channel(());
        let (state_tx, state_rx) = watch::channel(SyncState::Unconnected);
        let key = interest.key();
        let handle = DriverHandle {
            stop: stop_tx,
            retune: retune_tx,
            state: state_rx,
        };
        let driver = Self {
            coordinator,
            interest,
            key,
            stop: stop_rx,
            retune: retune_rx,
            state_tx,
            subscription: None,
            activated: None,
        };
        (handle, driver)
    }

    pub async fn run(mut self) {
        debug!(entity = M::entity_name(), interest = %self.key, "Sync driver started");
        let mut state = SyncState::Unconnected;

        loop {
            if *self.stop.borrow() {
                break;
            }
            state = match state {
                SyncState::Unconnected => {
                    let policy = self.coordinator.sync_policy(&self.key);
                    SyncState::Unconnected.start(&policy)
                }
                connecting @ SyncState::Connecting { .. } => self.connect(connecting).await,
                active @ SyncState::PushActive { .. } => self.stream(active).await,
                polling @ SyncState::Polling { .. } => self.poll(polling).await,
                SyncState::Stopped => break,
            };
            self.publish_state(&state);
        }

        self.subscription = None;
        let (key, activated) = (&self.key, self.activated);
        self.coordinator.pipeline().with_state(|s| {
            // A newer driver for the same key may already have activated.
            if s.guard.activated_at(key) == activated {
                s.guard.deactivate(key);
            }
        });
        self.state_tx.send_replace(SyncState::Stopped);
        debug!(entity = M::entity_name(), interest = %self.key, "Sync driver stopped");
    }

    fn publish_state(&self, state: &SyncState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous.label() != state.label() {
            debug!(
                entity = M::entity_name(),
                interest = %self.key,
                from = previous.label(),
                to = state.label(),
                "Sync state changed"
            );
        }
    }

    fn activate(&mut self, at: Timestamp) {
        let key = &self.key;
        self.activated = self.coordinator.pipeline().with_state(|s| {
            s.guard.activate(key.clone(), at);
            s.guard.activated_at(key)
        });
    }

    fn deactivate(&mut self) {
        let key = &self.key;
        self.coordinator.pipeline().with_state(|s| s.guard.deactivate(key));
        self.activated = None;
    }

    /// Fetch the whole region with a request made now.
    async fn refresh(&self) -> bool {
        match self.coordinator.refresh(&self.key).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    entity = M::entity_name(),
                    interest = %self.key,
                    error = %err,
                    "Sync refresh failed"
                );
                false
            }
        }
    }

    async fn connect(&mut self, state: SyncState) -> SyncState {
        let policy = self.coordinator.sync_policy(&self.key);
        let timeout = self.coordinator.config().push_connect_timeout;
        let push = self.coordinator.push();
        let coordinator = Arc::clone(&self.coordinator);
        let interest = self.interest.clone();
        let key = self.key.clone();

        let handshake = async move {
            let mut subscription = match push.subscribe(&interest).await {
                Ok(subscription) => subscription,
                Err(err) => return Err(err),
            };
            loop {
                match subscription.recv().await {
                    Some(PushMessage::Connected { active_at }) => return Ok((subscription, active_at)),
                    Some(PushMessage::Notification(notification)) => {
                        let outcome = coordinator
                            .pipeline()
                            .publish(notification.into_event(), UpdateSource::Push { interest: key.clone() });
                        coordinator.follow_up(outcome);
                    }
                    // Nothing to recover yet; the confirmation triggers a full refresh.
                    Some(PushMessage::Overloaded) => {}
                    None => return Err(TransportError::Closed),
                }
            }
        };

        let mut stop = self.stop.clone();
        let result = tokio::select! {
            _ = stopped(&mut stop) => return state.released(),
            result = tokio::time::timeout(timeout, handshake) => result,
        };

        match result {
            Ok(Ok((subscription, active_at))) => {
                let active_at = active_at.min(Utc::now());
                self.activate(active_at);
                self.subscription = Some(subscription);
                CacheMetrics::incr(&self.coordinator.metrics().push_connects);
                info!(entity = M::entity_name(), interest = %self.key, "Push subscription active");
                // Catch up on anything that changed before activation.
                self.refresh().await;
                state.connected(active_at)
            }
            Ok(Err(err)) => {
                warn!(
                    entity = M::entity_name(),
                    interest = %self.key,
                    error = %err,
                    "Push subscription failed, falling back to polling"
                );
                self.refresh().await;
                state.connection_lost(&policy)
            }
            Err(_) => {
                CacheMetrics::incr(&self.coordinator.metrics().push_timeouts);
                warn!(
                    entity = M::entity_name(),
                    interest = %self.key,
                    timeout_ms = timeout.as_millis() as u64,
                    "Push connection timed out, falling back to polling"
                );
                self.refresh().await;
                state.connect_timed_out(&policy)
            }
        }
    }

    async fn stream(&mut self, state: SyncState) -> SyncState {
        let mut stop = self.stop.clone();
        let message = match self.subscription.as_mut() {
            Some(subscription) => tokio::select! {
                _ = stopped(&mut stop) => return state.released(),
                message = subscription.recv() => message,
            },
            None => None,
        };

        match message {
            Some(PushMessage::Notification(notification)) => {
                let outcome = self.coordinator.pipeline().publish(
                    notification.into_event(),
                    UpdateSource::Push {
                        interest: self.key.clone(),
                    },
                );
                self.coordinator.follow_up(outcome);
                state
            }
            Some(PushMessage::Connected { active_at }) => {
                let active_at = active_at.min(Utc::now());
                self.activate(active_at);
                state.connected(active_at)
            }
            Some(PushMessage::Overloaded) => {
                CacheMetrics::incr(&self.coordinator.metrics().overloads);
                warn!(
                    entity = M::entity_name(),
                    interest = %self.key,
                    "Push channel overloaded, clearing region"
                );
                let now = Utc::now();
                self.activate(now);
                let mut outcome = self
                    .coordinator
                    .pipeline()
                    .publish(ChangeEvent::Invalidated(self.key.clone()), UpdateSource::Recovery);
                // The region itself is refreshed below.
                outcome.refetch.retain(|key| *key != self.key);
                self.coordinator.follow_up(outcome);
                self.refresh().await;
                state.overloaded(now)
            }
            None => {
                warn!(
                    entity = M::entity_name(),
                    interest = %self.key,
                    "Push subscription closed, falling back to polling"
                );
                self.subscription = None;
                self.deactivate();
                let policy = self.coordinator.sync_policy(&self.key);
                self.refresh().await;
                state.connection_lost(&policy)
            }
        }
    }

    async fn poll(&mut self, state: SyncState) -> SyncState {
        let (interval, failures) = match state {
            SyncState::Polling {
                interval, failures, ..
            } => (interval, failures),
            _ => return state,
        };
        let delay = if failures == 0 {
            interval
        } else {
            self.coordinator.config().backoff_for(failures - 1)
        };

        let mut stop = self.stop.clone();
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => return state.released(),
                _ = tokio::time::sleep_until(deadline) => break,
                Ok(()) = self.retune.changed() => {
                    let policy = self.coordinator.sync_policy(&self.key);
                    let retuned = state.clone().retuned(&policy, Instant::now());
                    if retuned != state {
                        info!(entity = M::entity_name(), interest = %self.key, "Sync policy changed");
                        return retuned;
                    }
                }
            }
        }

        let policy = self.coordinator.sync_policy(&self.key);
        if policy.push_eligible {
            let retried = state.clone().retry_push(Instant::now());
            if retried != state {
                info!(entity = M::entity_name(), interest = %self.key, "Retrying push subscription");
                return retried;
            }
        }

        CacheMetrics::incr(&self.coordinator.metrics().poll_cycles);
        if self.refresh().await {
            state.poll_succeeded(policy.poll_interval)
        } else {
            debug!(
                entity = M::entity_name(),
                interest = %self.key,
                failures = failures + 1,
                "Backing off after failed poll"
            );
            state.poll_failed()
        }
    }
}
