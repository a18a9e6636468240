//! Background catch-up of every projection for every tenant.

use crate::config::SpoolerConfig;
use crate::engine::{ProjectionBackend, ProjectionEngine};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Summary of one spooler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolerPass {
    /// Catch-ups that completed.
    pub caught_up: usize,
    /// Catch-ups that failed; they are attempted again next pass.
    pub errors: usize,
    /// Events processed across all catch-ups.
    pub processed: usize,
}

/// Periodically advances all registered projections, independent of reads.
pub struct Spooler<S> {
    engine: ProjectionEngine<S>,
    config: SpoolerConfig,
}

impl<S: ProjectionBackend> Spooler<S> {
    /// Creates a spooler for `engine`.
    pub const fn new(engine: ProjectionEngine<S>, config: SpoolerConfig) -> Self {
        Self { engine, config }
    }

    /// One pass over every (tenant, projection) pair, `concurrency` at a time.
    pub async fn run_once(&self, cancel: &CancellationToken) -> SpoolerPass {
        let tenants = match self.engine.store().tenants().await {
            Ok(tenants) => tenants,
            Err(error) => {
                warn!(error = %error, "[spooler.tenants] could not list tenants");
                return SpoolerPass {
                    errors: 1,
                    ..SpoolerPass::default()
                };
            }
        };

        let views = self.engine.views();
        let work: Vec<_> = tenants
            .iter()
            .flat_map(|tenant| views.iter().map(move |view| (view.clone(), tenant.clone())))
            .collect();

        let results: Vec<_> = stream::iter(work)
            .map(|(view, tenant)| async move {
                let result = self.engine.trigger(&view, &tenant, cancel).await;
                if let Err(error) = &result {
                    warn!(
                        projection = %view,
                        tenant = %tenant,
                        error = %error,
                        "[spooler.catch_up] catch-up failed"
                    );
                }
                result
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        results
            .into_iter()
            .fold(SpoolerPass::default(), |mut pass, result| {
                match result {
                    Ok(report) => {
                        pass.caught_up += 1;
                        pass.processed += report.processed;
                    }
                    Err(_) => pass.errors += 1,
                }
                pass
            })
    }

    /// Runs passes every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
                concurrency = self.config.concurrency,
                "[spooler.start] spooler started"
            );

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let pass = self.run_once(&cancel).await;
                if pass.errors > 0 {
                    error!(
                        errors = pass.errors,
                        caught_up = pass.caught_up,
                        "[spooler.pass] pass finished with errors"
                    );
                } else {
                    debug!(
                        caught_up = pass.caught_up,
                        processed = pass.processed,
                        "[spooler.pass] pass finished"
                    );
                }
            }

            info!("[spooler.stop] spooler stopped");
        })
    }
}
