//! Result delivery lifecycle.
//!
//! Owns "analyze ticker X" from submission to a single rendered outcome, and the
//! at most one live watch that a pending job needs.

use crate::error::{normalize_ticker, DeliveryError};
use crate::identity::IdentityProvider;
use crate::model::{
    AnalysisRequest, Credential, DeliveryState, JobState, Observation, Outcome,
    SubmissionResult, WatchEvent, GENERIC_ANALYSIS_FAILURE, WATCH_BROKEN,
};
use crate::render::Renderer;
use crate::submission::AnalysisSubmitter;
use crate::watch::{EventSink, JobWatcher, WatchHandle};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub struct ResultDeliveryController<R: Renderer> {
    submitter: Arc<dyn AnalysisSubmitter>,
    watcher: Arc<dyn JobWatcher>,
    renderer: R,
    events: EventSink,
    state: DeliveryState,
    // Single slot; replaced only after the previous handle is revoked.
    handle: Option<WatchHandle>,
    generation: u64,
}

impl<R: Renderer> ResultDeliveryController<R> {
    /// Create a controller and the receiving end of its watch event channel.
    pub fn new(
        submitter: Arc<dyn AnalysisSubmitter>,
        watcher: Arc<dyn JobWatcher>,
        renderer: R,
    ) -> (Self, UnboundedReceiver<WatchEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            submitter,
            watcher,
            renderer,
            events,
            state: DeliveryState::Idle,
            handle: None,
            generation: 0,
        };
        (controller, events_rx)
    }

    pub fn state(&self) -> &DeliveryState {
        &self.state
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn active_watch(&self) -> Option<&WatchHandle> {
        self.handle.as_ref()
    }

    /// Submit a ticker for analysis.
    ///
    /// Bad input and a missing session are rendered and returned as errors without
    /// touching the current request. Otherwise any live watch is revoked before the
    /// request goes out, and the returned state is `Rendered` or `Watching`.
    pub async fn submit(
        &mut self,
        raw_ticker: &str,
        credential: Option<&Credential>,
    ) -> Result<DeliveryState, DeliveryError> {
        let ticker = match normalize_ticker(raw_ticker) {
            Ok(t) => t,
            Err(e) => return Err(self.reject(e)),
        };
        let Some(credential) = credential else {
            return Err(self.reject(DeliveryError::not_signed_in()));
        };

        // Supersede the previous request before anything else can happen.
        self.revoke_watch();
        self.state = DeliveryState::Idle;

        let request = AnalysisRequest {
            ticker: ticker.clone(),
            credential: credential.clone(),
        };
        tracing::info!(ticker = %ticker, "starting analysis");

        match self.submitter.submit_analysis(&request).await {
            Ok(SubmissionResult::Completed(payload)) => {
                self.settle(Outcome::Success { ticker, payload });
            }
            Ok(SubmissionResult::Failed(reason)) => {
                self.settle(Outcome::Error(reason));
            }
            Ok(SubmissionResult::Pending(job_id)) => {
                self.generation += 1;
                let generation = self.generation;
                let handle =
                    self.watcher
                        .watch(&job_id, generation, credential, self.events.clone());
                tracing::info!(ticker = %ticker, job_id = %job_id, generation, "analysis in progress");
                self.handle = Some(handle);
                self.state = DeliveryState::Watching {
                    ticker,
                    job_id,
                    generation,
                };
            }
            Err(e) => {
                self.settle(Outcome::Error(e.user_message().to_string()));
            }
        }
        Ok(self.state.clone())
    }

    /// Apply a push from a watch. Returns true if the state changed.
    ///
    /// Events from revoked or superseded handles are dropped.
    pub fn on_watch_event(&mut self, event: WatchEvent) -> bool {
        let owned = self.handle.as_ref().is_some_and(|h| h.owns(&event));
        if !owned {
            tracing::debug!(
                job_id = %event.job_id,
                generation = event.generation,
                "ignoring event from a stale watch"
            );
            return false;
        }
        let DeliveryState::Watching { ticker, .. } = &self.state else {
            return false;
        };
        let ticker = ticker.clone();

        match event.observation {
            Observation::State(JobState::Completed(payload)) => {
                self.settle(Outcome::Success { ticker, payload });
                true
            }
            Observation::State(JobState::Failed(reason)) => {
                let reason = reason.unwrap_or_else(|| GENERIC_ANALYSIS_FAILURE.to_string());
                self.settle(Outcome::Error(reason));
                true
            }
            Observation::TransportError(detail) => {
                tracing::warn!(job_id = %event.job_id, %detail, "lost job updates");
                self.settle(Outcome::Error(WATCH_BROKEN.to_string()));
                true
            }
            Observation::State(JobState::Running) | Observation::Unrecognized => false,
        }
    }

    /// Abandon the current request without rendering anything.
    pub fn cancel(&mut self) {
        if self.handle.is_some() {
            tracing::info!("cancelling active analysis watch");
        }
        self.revoke_watch();
        self.state = DeliveryState::Idle;
    }

    fn revoke_watch(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.revoke();
        }
    }

    fn settle(&mut self, outcome: Outcome) {
        self.revoke_watch();
        match &outcome {
            Outcome::Success { ticker, payload } => {
                tracing::info!(ticker = %ticker, "analysis completed");
                self.renderer.render_success(ticker, payload);
            }
            Outcome::Error(reason) => {
                tracing::info!(%reason, "analysis failed");
                self.renderer.render_error(reason);
            }
        }
        self.state = DeliveryState::Rendered(outcome);
    }

    fn reject(&mut self, err: DeliveryError) -> DeliveryError {
        tracing::debug!(error = %err, "submission rejected locally");
        self.renderer.render_error(err.user_message());
        err
    }
}

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub enum UiCommand {
    Submit(String),
    Cancel,
    Quit,
}

/// Notifications for UI layers, sent after every command or state change.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    State(DeliveryState),
    Rejected(DeliveryError),
}

/// Drive a controller from UI commands, watch pushes, and session changes.
///
/// All transitions happen on this task, one at a time.
pub async fn run_controller<R: Renderer>(
    mut controller: ResultDeliveryController<R>,
    mut watch_rx: UnboundedReceiver<WatchEvent>,
    identity: Arc<dyn IdentityProvider>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
    status_tx: UnboundedSender<ControllerEvent>,
) -> Result<()> {
    let mut session_rx = identity.subscribe();
    let mut session_open = true;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Submit(ticker)) => {
                        let credential = identity.current_credential();
                        let ev = match controller.submit(&ticker, credential.as_ref()).await {
                            Ok(state) => ControllerEvent::State(state),
                            Err(e) => ControllerEvent::Rejected(e),
                        };
                        let _ = status_tx.send(ev);
                    }
                    Some(UiCommand::Cancel) => {
                        controller.cancel();
                        let _ = status_tx.send(ControllerEvent::State(DeliveryState::Idle));
                    }
                    Some(UiCommand::Quit) | None => {
                        controller.cancel();
                        break;
                    }
                }
            }
            Some(ev) = watch_rx.recv() => {
                if controller.on_watch_event(ev) {
                    let _ = status_tx.send(ControllerEvent::State(controller.state().clone()));
                }
            }
            changed = session_rx.changed(), if session_open => {
                match changed {
                    Ok(()) => {
                        let signed_out = session_rx.borrow_and_update().is_none();
                        if signed_out {
                            tracing::info!("session ended");
                            controller.cancel();
                            let _ = status_tx.send(ControllerEvent::State(DeliveryState::Idle));
                        }
                    }
                    // Identity provider is gone; nothing more will change.
                    Err(_) => session_open = false,
                }
            }
        }
    }

    Ok(())
}
