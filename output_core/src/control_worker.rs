//! The control thread.
//!
//! Every mutation of routing state (selection toggles, volume changes,
//! refreshes, shutdown) runs on one dedicated thread that owns the
//! [`OutputOrchestrator`]. Callers hand it closures through `call_sync` or
//! `call_async`; jobs run strictly in submission order, so no two operations
//! ever interleave.
//!
//! After each job the worker publishes an [`OutputSnapshot`] through an
//! `ArcSwap`, so readers never wait on the control thread. A job's result is
//! handed back only after that snapshot is stored: once a caller's future
//! resolves, `snapshot()` already shows the change.
//!
//! A panicking job is logged and dropped; the thread keeps serving requests.
//! When the worker stops (explicitly or on drop) it runs
//! [`OutputOrchestrator::shutdown`] before the thread exits.

use anyhow::{Result, anyhow};
use arc_swap::ArcSwap;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::Device;
use crate::error::HalError;
use crate::hal::AudioHardware;
use crate::orchestrator::{OrchestratorSettings, OutputOrchestrator, OutputSnapshot, OutputState};
use crate::volume::VolumeChannel;

/// Completes a caller's future. Runs once the job's effects are published.
type Reply = Box<dyn FnOnce() + Send>;
type Job = Box<dyn FnOnce(&mut OutputOrchestrator) -> Option<Reply> + Send>;

const THREAD_NAME: &str = "output-control";

pub struct ControlWorker {
    jobs: Mutex<Option<Sender<Job>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    snapshot: Arc<ArcSwap<OutputSnapshot>>,
}

impl ControlWorker {
    /// Spawn the control thread. The orchestrator is built on that thread and
    /// started (stale devices reclaimed, first scan) before any job runs.
    ///
    /// Returns once the first scan is published.
    pub fn start(
        hardware: Arc<dyn AudioHardware>,
        settings: OrchestratorSettings,
    ) -> Result<ControlWorker> {
        let (tx, rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<()>(1);
        let snapshot = Arc::new(ArcSwap::from_pointee(OutputSnapshot::default()));
        let published = snapshot.clone();

        let join_handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || worker_loop(hardware, settings, rx, published, ready_tx))?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("{} thread exited during startup", THREAD_NAME))?;

        Ok(ControlWorker {
            jobs: Mutex::new(Some(tx)),
            join_handle: Mutex::new(Some(join_handle)),
            snapshot,
        })
    }

    /// Run `f` on the control thread and block until it returns.
    ///
    /// Do not call this from an async task; use [`call_async`](Self::call_async).
    pub fn call_sync<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut OutputOrchestrator) -> R + Send + 'static,
    {
        futures::executor::block_on(self.call_async(f))
    }

    /// Run `f` on the control thread. The job is queued immediately; the
    /// returned future only waits for its result.
    pub fn call_async<R, F>(&self, f: F) -> BoxFuture<'static, Result<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut OutputOrchestrator) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |orch: &mut OutputOrchestrator| {
            let result = f(orch);
            let reply: Reply = Box::new(move || {
                let _ = tx.send(result);
            });
            Some(reply)
        });
        if let Err(e) = self.submit(job) {
            return Box::pin(futures::future::ready(Err(e)));
        }
        Box::pin(async move {
            rx.await
                .map_err(|_| anyhow!("control job was dropped before it completed"))
        })
    }

    /// Queue a device rescan without waiting for it.
    pub fn request_refresh(&self) -> Result<()> {
        self.submit(Box::new(|orch: &mut OutputOrchestrator| {
            orch.refresh();
            None
        }))
    }

    pub fn toggle_selection(&self, device: Device) -> BoxFuture<'static, Result<OutputState>> {
        self.call_async(move |orch| orch.toggle_selection(&device))
    }

    pub fn set_volume(
        &self,
        device: Device,
        level: f32,
    ) -> BoxFuture<'static, Result<Result<VolumeChannel, HalError>>> {
        self.call_async(move |orch| orch.set_volume(&device, level))
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Arc<OutputSnapshot> {
        self.snapshot.load_full()
    }

    /// The shared slot snapshots are published to.
    pub fn published(&self) -> Arc<ArcSwap<OutputSnapshot>> {
        self.snapshot.clone()
    }

    pub fn is_running(&self) -> bool {
        self.jobs.lock().is_some()
    }

    /// Stop accepting jobs, let the queue drain, run shutdown and join the thread.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        // Dropping the sender ends the worker loop once queued jobs have run.
        drop(self.jobs.lock().take());
        if let Some(handle) = self.join_handle.lock().take() {
            if handle.join().is_err() {
                log::error!("{} thread panicked during shutdown", THREAD_NAME);
            }
        }
    }

    fn submit(&self, job: Job) -> Result<()> {
        match self.jobs.lock().as_ref() {
            Some(tx) => tx
                .send(job)
                .map_err(|_| anyhow!("{} thread is gone", THREAD_NAME)),
            None => Err(anyhow!("control worker is stopped")),
        }
    }
}

impl Drop for ControlWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    hardware: Arc<dyn AudioHardware>,
    settings: OrchestratorSettings,
    rx: Receiver<Job>,
    published: Arc<ArcSwap<OutputSnapshot>>,
    ready: mpsc::SyncSender<()>,
) {
    let mut orch = OutputOrchestrator::new(hardware, settings);
    run_guarded(&mut orch, |o| o.start());
    published.store(Arc::new(orch.snapshot()));
    let _ = ready.send(());

    while let Ok(job) = rx.recv() {
        let reply = run_guarded(&mut orch, job).flatten();
        published.store(Arc::new(orch.snapshot()));
        if let Some(reply) = reply {
            reply();
        }
    }

    run_guarded(&mut orch, |o| o.shutdown());
    published.store(Arc::new(orch.snapshot()));
    log::debug!("{} thread exiting", THREAD_NAME);
}

/// Run `job`, logging a panic instead of letting it end the thread.
fn run_guarded<R, F>(orch: &mut OutputOrchestrator, job: F) -> Option<R>
where
    F: FnOnce(&mut OutputOrchestrator) -> R,
{
    match catch_unwind(AssertUnwindSafe(|| job(orch))) {
        Ok(value) => Some(value),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("control job panicked: {}", msg);
            None
        }
    }
}

/// Request a refresh every `period` until the worker goes away or the task is aborted.
///
/// The first refresh happens one period after the call. Ticks missed while the
/// runtime was busy are not replayed in a burst.
pub fn spawn_refresh_timer(
    worker: &Arc<ControlWorker>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    let worker: Weak<ControlWorker> = Arc::downgrade(worker);
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(worker) = worker.upgrade() else {
                break;
            };
            if let Err(e) = worker.request_refresh() {
                log::debug!("refresh timer stopping: {}", e);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimulatedHardware};

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            settle_delay: Duration::ZERO,
            ..OrchestratorSettings::default()
        }
    }

    fn setup() -> (Arc<SimulatedHardware>, ControlWorker) {
        let hw = Arc::new(SimulatedHardware::new());
        hw.add_device(SimDevice::output("a", "Device A"));
        hw.add_device(SimDevice::output("b", "Device B"));
        let worker = ControlWorker::start(hw.clone(), settings()).expect("start worker");
        (hw, worker)
    }

    #[test]
    fn start_publishes_first_scan() {
        let (_hw, worker) = setup();
        // Published before `start` returned; no job has run yet.
        let snap = worker.snapshot();
        assert_eq!(snap.devices.len(), 2);
        assert_eq!(snap.volumes.get("a"), Some(&0.5));
        assert!(!snap.is_sharing);
        assert_eq!(worker.call_sync(|o| o.devices().len()).unwrap(), 2);
    }

    #[tokio::test]
    async fn snapshot_is_current_when_job_resolves() {
        let (hw, worker) = setup();
        let devices = worker.snapshot().devices.clone();
        for round in 0..20 {
            worker.toggle_selection(devices[0].clone()).await.unwrap();
            let expected = if round % 2 == 0 { 1 } else { 0 };
            assert_eq!(worker.snapshot().selection.len(), expected);

            let level = 0.3 + round as f32 * 0.01;
            worker.set_volume(devices[1].clone(), level).await.unwrap().unwrap();
            assert_eq!(worker.snapshot().volumes.get("b"), Some(&level));
        }

        hw.remove_device("b");
        worker.call_async(|o| o.refresh()).await.unwrap();
        assert_eq!(worker.snapshot().devices.len(), 1);
    }

    #[tokio::test]
    async fn toggles_run_in_order() {
        let (hw, worker) = setup();
        let devices = worker.call_async(|o| o.devices().to_vec()).await.unwrap();

        let first = worker.toggle_selection(devices[0].clone());
        let second = worker.toggle_selection(devices[1].clone());
        assert_eq!(first.await.unwrap(), OutputState::SingleDeviceActive);
        assert_eq!(second.await.unwrap(), OutputState::MultiDeviceActive);

        let snap = worker.snapshot();
        assert!(snap.is_sharing);
        assert_eq!(snap.selection.len(), 2);
        assert_eq!(hw.aggregates().len(), 1);
    }

    #[tokio::test]
    async fn set_volume_reports_channel() {
        let (hw, worker) = setup();
        let a = worker.snapshot().devices[0].clone();
        let written = worker.set_volume(a, 0.8).await.unwrap();
        assert_eq!(written, Ok(VolumeChannel::Main));
        assert_eq!(hw.volume("a", crate::hal::element::MAIN), Some(0.8));
        assert_eq!(worker.snapshot().volumes.get("a"), Some(&0.8));
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let (_hw, worker) = setup();
        let res: Result<()> = worker.call_sync(|_| panic!("boom"));
        assert!(res.is_err());
        assert_eq!(worker.call_sync(|o| o.devices().len()).unwrap(), 2);
    }

    #[test]
    fn stop_tears_down_virtual_device() {
        let (hw, worker) = setup();
        let original = hw.default_output();
        worker
            .call_sync(|o| {
                let devices = o.devices().to_vec();
                for d in &devices {
                    o.toggle_selection(d);
                }
            })
            .unwrap();
        assert_eq!(hw.aggregates().len(), 1);

        worker.stop();
        assert!(hw.aggregates().is_empty());
        assert_eq!(hw.default_output(), original);
        assert!(!worker.is_running());
        assert!(!worker.snapshot().is_sharing);

        worker.stop();
        assert!(worker.call_sync(|_| ()).is_err());
        assert!(worker.request_refresh().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timer_picks_up_disconnects() {
        let (hw, worker) = setup();
        let worker = Arc::new(worker);
        worker.call_async(|_| ()).await.unwrap();
        let period = Duration::from_secs(3);
        let timer = spawn_refresh_timer(&worker, period);

        hw.remove_device("b");
        assert_eq!(worker.snapshot().devices.len(), 2);

        tokio::time::sleep(period + Duration::from_millis(10)).await;
        // Queued behind the timer's refresh.
        worker.call_async(|_| ()).await.unwrap();
        assert_eq!(worker.snapshot().devices.len(), 1);

        timer.abort();
    }
}
