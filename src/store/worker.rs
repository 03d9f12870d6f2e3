use super::Store;
use crate::core::{Result, StoreError};
use log::{trace, warn};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Background worker draining the store's tick queue on a fixed period.
pub struct TickWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TickWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StoreError::InvalidState(format!("tick worker join: {}", err)))?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TickWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub(super) fn spawn_tick_worker(store: Store, interval: Duration) -> Result<TickWorker> {
    let handle = Handle::try_current()
        .map_err(|_| StoreError::NoRuntime("tick worker needs a Tokio runtime".to_string()))?;
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = ticker.tick() => {
                    match store.run_tick() {
                        Ok(report) if report.flushed > 0 || report.records_changed > 0 => {
                            trace!("tick worker drained {:?}", report);
                        }
                        Ok(_) => {}
                        Err(StoreError::Destroyed) => break,
                        Err(err) => warn!("tick worker: {}", err),
                    }
                }
            }
        }
    });

    Ok(TickWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}
