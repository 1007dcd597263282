pub mod garbage_collector;
pub mod workqueue;

pub use garbage_collector::GarbageCollector;

use tokio::sync::watch;

/// Resolves once the stop signal is raised or its sender is gone.
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
