//! Change notifications for the config descriptor.
//!
//! A [`ConfigNotifier`] turns changes of the descriptor object into a stream
//! of [`ConfigEvent`]s that the [`ConfigSynchronizer`] applies one at a time.
//!
//! [`ConfigSynchronizer`]: crate::ConfigSynchronizer

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use object_store::{ObjectStore, path::Path as ObjPath};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::store::ConfigStore;

/// Default interval between two polls of the descriptor.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    /// The descriptor was created or overwritten.
    Updated,
    /// The descriptor was deleted.
    Removed,
}

/// Source of descriptor change events.
pub trait ConfigNotifier: std::fmt::Debug + Send + Sync {
    fn subscribe(&self) -> BoxStream<'static, ConfigEvent>;
}

/// Notifier fed through an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<ConfigEvent>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Publish `event` to every subscriber. Events sent while nobody is
    /// subscribed are lost.
    pub fn notify(&self, event: ConfigEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigNotifier for ChannelNotifier {
    fn subscribe(&self) -> BoxStream<'static, ConfigEvent> {
        futures::stream::unfold(self.tx.subscribe(), |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((event, rx)),
                // a reload covers whatever was missed
                Err(RecvError::Lagged(_)) => Some((ConfigEvent::Updated, rx)),
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}

/// Notifier that polls the descriptor's metadata.
///
/// The first successful poll always reports the descriptor's state so that a
/// change made between startup and the first poll is not lost.
#[derive(Debug, Clone)]
pub struct PollingNotifier {
    object_store: Arc<dyn ObjectStore>,
    path: ObjPath,
    interval: Duration,
}

impl PollingNotifier {
    pub fn new(store: &ConfigStore, interval: Duration) -> Self {
        Self {
            object_store: store.object_store(),
            path: store.path().clone(),
            interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Unknown,
    Missing,
    Present {
        e_tag: Option<String>,
        last_modified: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct PollState {
    object_store: Arc<dyn ObjectStore>,
    path: ObjPath,
    ticker: Interval,
    observed: Observed,
}

impl PollState {
    async fn next_event(&mut self) -> ConfigEvent {
        loop {
            self.ticker.tick().await;
            let observed = match self.object_store.head(&self.path).await {
                Ok(meta) => Observed::Present {
                    e_tag: meta.e_tag,
                    last_modified: meta.last_modified,
                },
                Err(object_store::Error::NotFound { .. }) => Observed::Missing,
                Err(e) => {
                    warn!(error = %e, path = %self.path, "failed to poll config descriptor");
                    continue;
                }
            };
            if observed == self.observed {
                continue;
            }
            debug!(path = %self.path, ?observed, "config descriptor changed");
            let event = match observed {
                Observed::Missing => ConfigEvent::Removed,
                _ => ConfigEvent::Updated,
            };
            self.observed = observed;
            return event;
        }
    }
}

impl ConfigNotifier for PollingNotifier {
    fn subscribe(&self) -> BoxStream<'static, ConfigEvent> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let state = PollState {
            object_store: Arc::clone(&self.object_store),
            path: self.path.clone(),
            ticker,
            observed: Observed::Unknown,
        };
        futures::stream::unfold(state, |mut state| async move {
            let event = state.next_event().await;
            Some((event, state))
        })
        .boxed()
    }
}
