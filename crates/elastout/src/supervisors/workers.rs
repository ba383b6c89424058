//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all the credit.
//!
//! - [`DispatchWorker`]: events in, bulk requests out, delivery reports back.
//! - [`HealthWorker`]: re-probes the nodes until told to stop.

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

mod dispatch_worker;
mod health_worker;

pub(crate) use dispatch_worker::DispatchWorker;
pub(crate) use health_worker::HealthWorker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}

/// 🛑 Resolves once the run-level shutdown flag flips to `true`.
///
/// A dropped sender means nobody can cancel us anymore, so this pends forever instead.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let sender_gone = shutdown.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}
