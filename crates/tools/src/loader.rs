use std::path::PathBuf;

use foundation::LayerId;
use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use streaming::{LayerLoader, LoadError, LoadOutcome};
use tracing::debug;

/// Loads `<dir>/<layer-id>.geojson`.
#[derive(Debug, Clone)]
pub struct DirLoader {
    dir: PathBuf,
}

impl DirLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, layer: &LayerId) -> PathBuf {
        self.dir.join(format!("{layer}.geojson"))
    }
}

impl LayerLoader for DirLoader {
    fn fetch(&self, layer: &LayerId) -> LocalBoxFuture<'static, LoadOutcome> {
        let path = self.path_for(layer);
        async move {
            debug!(path = %path.display(), "reading layer source");
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| LoadError::Fetch(format!("{}: {err}", path.display())))
        }
        .boxed_local()
    }
}
