//! Test hook that withholds selected messages and delivers them once a
//! condition on the receiving server holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::NetworkError;
use crate::protocol::Message;
use crate::server::{Entity, ServerCore};
use crate::types::EntityId;

type InterceptFn = Box<dyn Fn(&Message) -> bool + Send + Sync>;
type DeliverCondFn = Box<dyn Fn(&ServerCore, &Message) -> bool + Send + Sync>;
type DeliverActionFn = Box<dyn Fn(&mut ServerCore, Message) + Send + Sync>;

pub struct Interceptor {
    name: String,
    owner: EntityId,
    should_intercept: InterceptFn,
    should_deliver: DeliverCondFn,
    deliver_action: DeliverActionFn,
}

impl Interceptor {
    pub fn new(
        name: impl Into<String>,
        owner: EntityId,
        should_intercept: impl Fn(&Message) -> bool + Send + Sync + 'static,
        should_deliver: impl Fn(&ServerCore, &Message) -> bool + Send + Sync + 'static,
        deliver_action: impl Fn(&mut ServerCore, Message) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            owner,
            should_intercept: Box::new(should_intercept),
            should_deliver: Box::new(should_deliver),
            deliver_action: Box::new(deliver_action),
        }
    }

    /// An interceptor whose delivery runs the message's regular action.
    pub fn delaying(
        name: impl Into<String>,
        owner: EntityId,
        should_intercept: impl Fn(&Message) -> bool + Send + Sync + 'static,
        should_deliver: impl Fn(&ServerCore, &Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, owner, should_intercept, should_deliver, |core, msg| {
            let sender = msg.sender;
            if let Err(e) = core.execute_message(msg) {
                tracing::warn!(%sender, error = %e, "delayed delivery failed");
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> EntityId {
        self.owner
    }
}

/// Interceptors of every server taking part in one run. Disabled until
/// `enable` is called.
#[derive(Default)]
pub struct InterceptionContext {
    enabled: AtomicBool,
    interceptors: RwLock<HashMap<EntityId, Vec<Arc<Interceptor>>>>,
}

impl InterceptionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn register(&self, interceptor: Interceptor) -> Result<(), NetworkError> {
        let mut map = self.interceptors.write();
        let list = map.entry(interceptor.owner).or_default();
        if list.iter().any(|i| i.name == interceptor.name) {
            return Err(NetworkError::InvalidArgument(format!(
                "interceptor {} already registered for entity {}",
                interceptor.name, interceptor.owner
            )));
        }
        list.push(Arc::new(interceptor));
        Ok(())
    }

    pub fn count(&self, owner: EntityId) -> usize {
        self.interceptors.read().get(&owner).map_or(0, Vec::len)
    }

    /// The first interceptor of `owner`, in registration order, that wants
    /// to withhold `msg`.
    pub fn claim(&self, owner: EntityId, msg: &Message) -> Option<Arc<Interceptor>> {
        if !self.is_enabled() {
            return None;
        }
        self.interceptors
            .read()
            .get(&owner)?
            .iter()
            .find(|i| (i.should_intercept)(msg))
            .cloned()
    }
}

/// Wait on `entity` until `interceptor` accepts to deliver `msg`, then
/// deliver it once. The condition is re-evaluated on every state change
/// of the entity and at least every `poll_interval`.
pub(crate) fn spawn_delayed_delivery(
    entity: Arc<Entity>,
    interceptor: Arc<Interceptor>,
    msg: Message,
    poll_interval: Duration,
    shutdown_token: CancellationToken,
) {
    tracing::debug!(
        interceptor = %interceptor.name,
        owner = %interceptor.owner,
        sender = %msg.sender,
        "message intercepted"
    );

    std::thread::spawn(move || {
        let mut core = entity.lock();
        loop {
            if shutdown_token.is_cancelled() {
                return;
            }
            if (interceptor.should_deliver)(&core, &msg) {
                break;
            }
            entity.wait_for_change(&mut core, poll_interval);
        }

        tracing::debug!(interceptor = %interceptor.name, sender = %msg.sender, "delivering intercepted message");
        (interceptor.deliver_action)(&mut core, msg);
        drop(core);
        entity.notify_changed();
    });
}
