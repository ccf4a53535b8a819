//! Awaitable view of a durable promise.

use std::future::{Future, IntoFuture};
use std::pin::Pin;

use tether_types::{Outcome, PromiseId};
use thiserror::Error;
use tokio::sync::watch;

/// The promise behind a bridge was dropped before it settled, typically
/// because it was removed from its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("promise {id} was dropped before it settled")]
pub struct BridgeClosed {
    pub id: PromiseId,
}

/// Awaitable handle returned by [`crate::Promise::to_bridge`].
///
/// Every bridge of one promise observes the same completion slot, so all of
/// them complete with the same outcome, exactly once.
#[derive(Debug, Clone)]
pub struct PromiseBridge {
    id: PromiseId,
    rx: watch::Receiver<Option<Outcome>>,
}

impl PromiseBridge {
    pub(crate) fn new(id: PromiseId, rx: watch::Receiver<Option<Outcome>>) -> Self {
        Self { id, rx }
    }

    #[must_use]
    pub fn id(&self) -> PromiseId {
        self.id
    }

    /// The outcome if the bridge has already completed.
    #[must_use]
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.rx.borrow().clone()
    }

    /// Suspend until the promise is consumed.
    pub async fn wait(mut self) -> Result<Outcome, BridgeClosed> {
        let id = self.id;
        let completed = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BridgeClosed { id })?;
        completed.clone().ok_or(BridgeClosed { id })
    }
}

impl IntoFuture for PromiseBridge {
    type Output = Result<Outcome, BridgeClosed>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
