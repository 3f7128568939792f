/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

type Listener<E> = Box<dyn FnMut(&E)>;

/// Events kept in the log when no limit is given.
pub const DEFAULT_EVENT_LOG_LIMIT: usize = 256;

/// Publish side of the state-change stream.
///
/// Every emitted event is delivered synchronously to each subscriber (in
/// subscription order). The log keeps only the most recent `log_limit`
/// events; subscribers see everything.
pub struct EventBus<E> {
    events: Vec<E>,
    log_limit: usize,
    next_subscription: u64,
    listeners: Vec<(SubscriptionId, Listener<E>)>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::with_log_limit(DEFAULT_EVENT_LOG_LIMIT)
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("pending_events", &self.events.len())
            .field("log_limit", &self.log_limit)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_limit(log_limit: usize) -> Self {
        Self {
            events: Vec::new(),
            log_limit,
            next_subscription: 0,
            listeners: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&E) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription = self.next_subscription.wrapping_add(1);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        before != self.listeners.len()
    }

    pub fn emit(&mut self, event: E) {
        for (_id, listener) in &mut self.listeners {
            listener(&event);
        }
        self.events.push(event);
        if self.events.len() > self.log_limit {
            let excess = self.events.len() - self.log_limit;
            self.events.drain(..excess);
        }
    }

    pub fn events(&self) -> &[E] {
        &self.events
    }

    pub fn drain(&mut self) -> Vec<E> {
        std::mem::take(&mut self.events)
    }
}
