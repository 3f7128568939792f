use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use foundation::LayerId;
use futures_util::future::{AbortHandle, Abortable, FutureExt, LocalBoxFuture, Shared};
use tracing::debug;

use crate::loader::{LayerLoader, LoadError, LoadOutcome};
use crate::request::Request;

type SharedLoad = Shared<LocalBoxFuture<'static, LoadOutcome>>;

/// A handle on an in-flight layer load. Every clone resolves to the same
/// outcome; awaiting it never starts another fetch.
#[derive(Clone)]
pub struct PendingLoad {
    layer: LayerId,
    request: Request,
    future: SharedLoad,
}

impl PendingLoad {
    pub fn layer(&self) -> &LayerId {
        &self.layer
    }

    pub fn request(&self) -> Request {
        self.request
    }
}

impl std::fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLoad")
            .field("layer", &self.layer)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Future for PendingLoad {
    type Output = LoadOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.poll_unpin(cx)
    }
}

struct InFlight {
    request: Request,
    future: SharedLoad,
    abort: AbortHandle,
}

/// Whether [`InFlightLoads::begin`] started a fetch or joined one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BeginKind {
    Started,
    Joined,
}

/// Table of layer loads currently in flight.
///
/// Key properties:
/// - At most one fetch per layer: `begin` on a loading layer returns a clone
///   of the existing load.
/// - Loads are abortable; waiters of an aborted load see `LoadError::Aborted`.
/// - Entries are removed explicitly (`finish`/`cancel`), matched by
///   [`Request`] so a stale completion cannot retire a newer load.
#[derive(Default)]
pub struct InFlightLoads {
    next_request: u64,
    fetches_started: u64,
    entries: BTreeMap<LayerId, InFlight>,
}

impl std::fmt::Debug for InFlightLoads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightLoads")
            .field("fetches_started", &self.fetches_started)
            .field("loading", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InFlightLoads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_loading(&self, layer: &LayerId) -> bool {
        self.entries.contains_key(layer)
    }

    /// Total number of fetches handed to a loader.
    pub fn fetches_started(&self) -> u64 {
        self.fetches_started
    }

    pub fn pending(&self, layer: &LayerId) -> Option<PendingLoad> {
        self.entries.get(layer).map(|entry| PendingLoad {
            layer: layer.clone(),
            request: entry.request,
            future: entry.future.clone(),
        })
    }

    /// Joins the layer's in-flight load, or starts one through `loader`.
    pub fn begin(&mut self, layer: &LayerId, loader: &dyn LayerLoader) -> (PendingLoad, BeginKind) {
        if let Some(pending) = self.pending(layer) {
            debug!(layer = %layer, request = pending.request.0, "joining in-flight load");
            return (pending, BeginKind::Joined);
        }

        let request = Request(self.next_request);
        self.next_request = self.next_request.wrapping_add(1);
        self.fetches_started += 1;

        let (abort, registration) = AbortHandle::new_pair();
        let fetch = Abortable::new(loader.fetch(layer), registration);
        let future: LocalBoxFuture<'static, LoadOutcome> = async move {
            match fetch.await {
                Ok(outcome) => outcome,
                Err(_aborted) => Err(LoadError::Aborted),
            }
        }
        .boxed_local();
        let future = future.shared();

        self.entries.insert(
            layer.clone(),
            InFlight {
                request,
                future: future.clone(),
                abort,
            },
        );

        (
            PendingLoad {
                layer: layer.clone(),
                request,
                future,
            },
            BeginKind::Started,
        )
    }

    /// Retires the load for `layer` if `request` is still the current one.
    pub fn finish(&mut self, layer: &LayerId, request: Request) -> bool {
        match self.entries.get(layer) {
            Some(entry) if entry.request == request => {
                self.entries.remove(layer);
                true
            }
            _ => false,
        }
    }

    /// Aborts and retires the layer's load. Returns `true` if one was in flight.
    pub fn cancel(&mut self, layer: &LayerId) -> bool {
        let Some(entry) = self.entries.remove(layer) else {
            return false;
        };
        entry.abort.abort();
        debug!(layer = %layer, request = entry.request.0, "load aborted");
        true
    }
}
