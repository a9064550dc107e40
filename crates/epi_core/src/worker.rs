//! Runs a simulation on a background thread.
//!
//! The caller talks to the worker only through the cancel flag, a progress
//! channel read latest-value-wins, and the terminal [`Outcome`].

use crate::driver::{CancelFlag, Outcome, Simulation};
use crate::error::SimulationError;
use crate::progress::Progress;
use crossbeam_channel::{unbounded, Receiver};
use std::thread::{self, JoinHandle};
use tracing::warn;

pub struct SimulationHandle {
    cancel: CancelFlag,
    progress: Receiver<Progress>,
    latest: Option<Progress>,
    thread: JoinHandle<Outcome>,
}

impl SimulationHandle {
    /// Requests cancellation. The worker stops before committing its next
    /// step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The most recent report, dropping any older ones still queued.
    pub fn latest_progress(&mut self) -> Option<&Progress> {
        if let Some(progress) = self.progress.try_iter().last() {
            self.latest = Some(progress);
        }
        self.latest.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the run to end.
    pub fn join(self) -> Outcome {
        self.thread.join().unwrap_or_else(|_| {
            warn!("simulation worker panicked");
            Outcome::Failed(SimulationError::WorkerPanicked)
        })
    }
}

pub fn spawn_simulation(simulation: Simulation) -> SimulationHandle {
    spawn_simulation_with(simulation, |_| {})
}

/// Like [`spawn_simulation`], calling `on_complete` on the worker thread with
/// the outcome before it is handed to [`SimulationHandle::join`].
pub fn spawn_simulation_with<F>(mut simulation: Simulation, on_complete: F) -> SimulationHandle
where
    F: FnOnce(&Outcome) + Send + 'static,
{
    let cancel = simulation.cancel_flag();
    let (tx, rx) = unbounded();
    let thread = thread::spawn(move || {
        // A dropped receiver only means nobody is listening.
        let mut forward = |progress: &Progress| {
            let _ = tx.send(progress.clone());
        };
        let outcome = simulation.run_to_end(&mut forward);
        on_complete(&outcome);
        outcome
    });
    SimulationHandle {
        cancel,
        progress: rx,
        latest: None,
        thread,
    }
}
