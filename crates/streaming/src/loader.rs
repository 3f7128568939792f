use foundation::LayerId;
use futures_util::future::LocalBoxFuture;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("load aborted")]
    Aborted,
    #[error("no loader configured for layer `{0}`")]
    NoLoader(LayerId),
}

/// Raw layer source text, or why it could not be fetched.
///
/// `Clone` so one outcome can be handed to every coalesced waiter.
pub type LoadOutcome = Result<String, LoadError>;

/// Fetches layer sources on demand (network, disk, embedded assets).
///
/// Runs on the single-threaded event loop, so the returned future does not
/// need to be `Send`.
pub trait LayerLoader {
    fn fetch(&self, layer: &LayerId) -> LocalBoxFuture<'static, LoadOutcome>;
}
