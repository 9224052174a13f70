use crate::harvest::{HarvestError, Harvester};
use crate::model::ScanResult;
use crate::traits::WatermarkStore;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the next tick
    Idle,
    /// Running a pass and persisting its watermark
    Scanning,
}

/// Drives a [`Harvester`] through back-to-back passes separated by a fixed delay.
///
/// The delay starts only after a pass and its persist have finished, so
/// passes never overlap.
pub struct HarvestLoop<S>
where
    S: WatermarkStore,
{
    harvester: Harvester<S>,
    interval: Duration,
    state: LoopState,
}

impl<S> HarvestLoop<S>
where
    S: WatermarkStore,
{
    pub fn new(harvester: Harvester<S>) -> Self {
        let interval = harvester.config().interval;
        Self {
            harvester,
            interval,
            state: LoopState::Scanning,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn harvester(&self) -> &Harvester<S> {
        &self.harvester
    }

    /// Runs a single pass.
    pub async fn run_once(&mut self) -> Result<ScanResult, HarvestError> {
        self.state = LoopState::Scanning;
        let result = self.harvester.run_pass().await;
        self.state = LoopState::Idle;
        result
    }

    /// Runs passes until `shutdown` resolves, returning how many ran.
    ///
    /// The first pass starts immediately. `shutdown` is only observed while
    /// idle; a pass in flight always completes along with its persist.
    pub async fn run_until<F>(&mut self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut passes = 0;

        loop {
            match self.run_once().await {
                Ok(result) if result.copied > 0 => info!(
                    "{} files copied. Sleeping for {} seconds.",
                    result.copied,
                    self.interval.as_secs()
                ),
                Ok(_) => {}
                Err(e) => error!("Harvest pass failed: {}", e),
            }
            passes += 1;

            tokio::select! {
                _ = &mut shutdown => {
                    info!(passes, "Shutting down");
                    return passes;
                }
                _ = tokio::time::sleep(self.interval) => {
                    debug!("Tick");
                }
            }
        }
    }

    /// Runs passes until the process is terminated.
    pub async fn run_forever(&mut self) -> usize {
        self.run_until(std::future::pending()).await
    }
}

/// Turns a signal listener into a shutdown future for [`HarvestLoop::run_until`].
///
/// The listener is spawned right away so a signal arriving during the first
/// pass is not missed. If the listener fails, the returned future never
/// resolves and the loop runs until the process is killed.
pub fn shutdown_on<F>(signal: F) -> impl Future<Output = ()>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => {
                warn!("Failed to listen for shutdown signal, running until killed: {}", e);
                // Dropping the sender would resolve the shutdown future
                let _keep_running = tx;
                std::future::pending::<()>().await;
            }
        }
    });

    async move {
        let _ = rx.await;
    }
}
