//! Mapped cover entity.
//!
//! [`MappedCover`] is the caller-facing cover. It owns the targets and the
//! convergence run slot for one source device:
//!
//! - reads remap the target while one is set, otherwise the device feedback
//! - writes update the target and restart the run
//! - a restarted run waits for its predecessor to exit before it starts, so
//!   at most one run per cover is ever live
//!
//! Targets and the run slot sit behind one short `parking_lot` lock that is
//! never held across an await.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mappedcover_commands::{
    CommandDispatcher, CoverCommand, DispatchError, DispatchFailure, DispatchOutcome, RetryPolicy,
};
use mappedcover_core::{
    to_normalized, to_physical, Axis, AxisRanges, Capabilities, ControllerSettings, CoverFeatures,
    EntryConfig, MotionState, NormalizedValue, PhysicalValue, RenameRule, SourceId, SourceState,
    SCALE_MAX,
};

use crate::controller::{ConvergenceRun, RunOptions, RunOutcome, Targets};

/// Errors from cover commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoverError {
    /// Source device is unavailable
    #[error("Source {0} is unavailable")]
    Unavailable(SourceId),

    /// The source cover lacks the capability
    #[error("{0} is not supported by the source cover")]
    NotSupported(&'static str),

    /// An immediate command failed
    #[error(transparent)]
    Dispatch(#[from] DispatchFailure),

    /// A command was malformed
    #[error(transparent)]
    Rejected(#[from] DispatchError),
}

/// Effect of a write command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    /// Target changed and a run was started
    Converging,
    /// Nothing to do
    Unchanged,
    /// Sent immediately
    Sent,
}

/// Run counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunStats {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub failed: u64,
    /// Most runs observed live at once
    pub peak_live: usize,
}

/// Construction parameters for a [`MappedCover`].
#[derive(Debug, Clone)]
pub struct CoverParams {
    pub entry_id: String,
    pub source_id: SourceId,
    /// Source device display name, when the host knows one
    pub source_name: Option<String>,
    pub ranges: AxisRanges,
    pub close_tilt_if_down: bool,
    pub rename: RenameRule,
    pub settings: ControllerSettings,
}

impl CoverParams {
    /// Parameters for one source of an entry.
    pub fn from_entry(
        entry: &EntryConfig,
        source_id: impl Into<SourceId>,
        settings: ControllerSettings,
    ) -> Result<Self, mappedcover_core::ConfigError> {
        Ok(Self {
            entry_id: entry.id.clone(),
            source_id: source_id.into(),
            source_name: None,
            ranges: entry.ranges(),
            close_tilt_if_down: entry.close_tilt_if_down,
            rename: entry.rename_rule()?,
            settings,
        })
    }

    pub fn with_source_name(mut self, name: Option<String>) -> Self {
        self.source_name = name;
        self
    }
}

struct RunSlot {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    targets: Targets,
    run: Option<RunSlot>,
}

struct Inner {
    entry_id: String,
    source_id: SourceId,
    name: String,
    unique_id: String,
    ranges: AxisRanges,
    options: RunOptions,
    capabilities: Capabilities,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: CancellationToken,
    slot: Mutex<Slot>,
    stats: Mutex<RunStats>,
    live: AtomicUsize,
}

/// A remapped virtual cover.
#[derive(Clone)]
pub struct MappedCover {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MappedCover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedCover")
            .field("unique_id", &self.inner.unique_id)
            .field("targets", &self.targets())
            .finish()
    }
}

impl MappedCover {
    /// Build a cover. Capabilities are read from the source once, here.
    pub fn new(params: CoverParams, dispatcher: Arc<CommandDispatcher>) -> Self {
        let features = dispatcher
            .feed()
            .current(&params.source_id)
            .map(|s| s.supported_features)
            .unwrap_or_default();
        let capabilities = Capabilities::from_features(features);
        let display = params.source_name.as_deref().unwrap_or(&params.source_id);
        let name = params.rename.apply(display);
        let unique_id = format!("{}_{}", params.entry_id, params.source_id);

        tracing::debug!(
            category = "cover",
            entity = %unique_id,
            %name,
            tilt = capabilities.tilt,
            "Created mapped cover"
        );

        Self {
            inner: Arc::new(Inner {
                entry_id: params.entry_id,
                source_id: params.source_id,
                name,
                unique_id,
                ranges: params.ranges,
                options: RunOptions {
                    close_tilt_if_down: params.close_tilt_if_down,
                    settings: params.settings,
                },
                capabilities,
                dispatcher,
                shutdown: CancellationToken::new(),
                slot: Mutex::new(Slot::default()),
                stats: Mutex::new(RunStats::default()),
                live: AtomicUsize::new(0),
            }),
        }
    }

    // ========== Identity ==========

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `{entry_id}_{source_id}`
    pub fn unique_id(&self) -> &str {
        &self.inner.unique_id
    }

    pub fn entry_id(&self) -> &str {
        &self.inner.entry_id
    }

    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    // ========== Read path ==========

    fn source(&self) -> Option<SourceState> {
        self.inner.source()
    }

    pub fn available(&self) -> bool {
        self.source().is_some_and(|s| s.is_available())
    }

    /// Normalized position. The target while one is set.
    pub fn current_position(&self) -> Option<NormalizedValue> {
        self.read_axis(Axis::Position)
    }

    /// Normalized tilt. The target while one is set.
    pub fn current_tilt_position(&self) -> Option<NormalizedValue> {
        if !self.inner.capabilities.tilt {
            return None;
        }
        self.read_axis(Axis::Tilt)
    }

    fn read_axis(&self, axis: Axis) -> Option<NormalizedValue> {
        let source = self.source().filter(|s| s.is_available())?;
        let range = self.inner.ranges.for_axis(axis);
        let physical = self
            .targets()
            .get(axis)
            .or_else(|| source.attribute(axis.attribute()))?;
        Some(to_normalized(physical, range))
    }

    /// Physical targets, for diagnostics.
    pub fn targets(&self) -> Targets {
        self.inner.slot.lock().targets
    }

    pub fn is_moving(&self) -> bool {
        self.inner.is_moving()
    }

    pub fn is_closed(&self) -> bool {
        self.current_position() == Some(0) && matches!(self.current_tilt_position(), Some(0) | None)
    }

    pub fn is_opening(&self) -> bool {
        self.direction(MotionState::Opening)
    }

    pub fn is_closing(&self) -> bool {
        self.direction(MotionState::Closing)
    }

    fn direction(&self, motion: MotionState) -> bool {
        let Some(source) = self.source().filter(|s| s.is_available()) else {
            return false;
        };
        match (self.targets().position, source.position()) {
            (Some(target), Some(current)) => match motion {
                MotionState::Opening => target > current,
                _ => target < current,
            },
            _ => source.motion == motion,
        }
    }

    pub fn device_class(&self) -> Option<String> {
        self.source().and_then(|s| s.device_class)
    }

    /// Source features limited to the ones this cover remaps.
    pub fn supported_features(&self) -> CoverFeatures {
        self.source()
            .map(|s| s.supported_features & CoverFeatures::REMAPPED)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RunStats {
        *self.inner.stats.lock()
    }

    /// Runs currently executing.
    pub fn live_runs(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    // ========== Write path ==========

    fn require_available(&self) -> Result<SourceState, CoverError> {
        match self.source().filter(|s| s.is_available()) {
            Some(state) => Ok(state),
            None => {
                self.inner.abandon_run();
                Err(CoverError::Unavailable(self.inner.source_id.clone()))
            }
        }
    }

    fn require_tilt(&self) -> Result<(), CoverError> {
        if self.inner.capabilities.tilt {
            Ok(())
        } else {
            Err(CoverError::NotSupported("tilt"))
        }
    }

    /// Move to a normalized position.
    ///
    /// With no tilt target set, the current tilt becomes the tilt target so it
    /// is restored after the move.
    pub async fn set_position(&self, position: NormalizedValue) -> Result<Applied, CoverError> {
        let source = self.require_available()?;
        let physical = to_physical(position, self.inner.ranges.position);
        let current_tilt = self
            .inner
            .capabilities
            .tilt
            .then(|| source.tilt_position())
            .flatten();

        let mut slot = self.inner.slot.lock();
        if !needs_change(slot.targets.position, source.position(), physical) {
            tracing::debug!(category = "cover", entity = %self.inner.unique_id, physical, "Position unchanged");
            return Ok(Applied::Unchanged);
        }
        slot.targets.position = Some(physical);
        if slot.targets.tilt.is_none() {
            slot.targets.tilt = current_tilt;
        }
        self.inner.restart_run(&mut slot);
        Ok(Applied::Converging)
    }

    /// Move to a normalized tilt.
    pub async fn set_tilt_position(&self, tilt: NormalizedValue) -> Result<Applied, CoverError> {
        self.require_tilt()?;
        let source = self.require_available()?;
        let physical = to_physical(tilt, self.inner.ranges.tilt);
        Ok(self.apply_targets(&source, None, Some(physical)))
    }

    /// Fully open. Tilt opens too when supported.
    pub async fn open(&self) -> Result<Applied, CoverError> {
        let source = self.require_available()?;
        let tilt = self
            .inner
            .capabilities
            .tilt
            .then(|| to_physical(SCALE_MAX, self.inner.ranges.tilt));
        Ok(self.apply_targets(
            &source,
            Some(to_physical(SCALE_MAX, self.inner.ranges.position)),
            tilt,
        ))
    }

    /// Fully close. Tilt closes too when supported.
    pub async fn close(&self) -> Result<Applied, CoverError> {
        let source = self.require_available()?;
        let tilt = self.inner.capabilities.tilt.then_some(0);
        Ok(self.apply_targets(&source, Some(0), tilt))
    }

    pub async fn open_tilt(&self) -> Result<Applied, CoverError> {
        self.require_tilt()?;
        let source = self.require_available()?;
        let tilt = to_physical(SCALE_MAX, self.inner.ranges.tilt);
        Ok(self.apply_targets(&source, None, Some(tilt)))
    }

    pub async fn close_tilt(&self) -> Result<Applied, CoverError> {
        self.require_tilt()?;
        let source = self.require_available()?;
        Ok(self.apply_targets(&source, None, Some(0)))
    }

    /// Set the given axes, skipping those already at their value, and
    /// restart the run if anything changed.
    fn apply_targets(
        &self,
        source: &SourceState,
        position: Option<PhysicalValue>,
        tilt: Option<PhysicalValue>,
    ) -> Applied {
        let mut slot = self.inner.slot.lock();
        let mut changed = false;
        for (axis, value) in [(Axis::Position, position), (Axis::Tilt, tilt)] {
            let Some(value) = value else { continue };
            if needs_change(slot.targets.get(axis), source.attribute(axis.attribute()), value) {
                slot.targets.set(axis, Some(value));
                changed = true;
            }
        }
        if !changed {
            return Applied::Unchanged;
        }
        self.inner.restart_run(&mut slot);
        Applied::Converging
    }

    /// Clear all targets, cancel the run and stop the device.
    pub async fn stop(&self) -> Result<Applied, CoverError> {
        self.require_available()?;
        {
            let mut slot = self.inner.slot.lock();
            slot.targets = Targets::default();
            Inner::cancel_locked(&slot);
        }
        self.send_now(CoverCommand::stop(self.inner.source_id.clone())).await
    }

    /// Clear the tilt target and stop tilting. A pending position target
    /// keeps converging.
    pub async fn stop_tilt(&self) -> Result<Applied, CoverError> {
        self.require_tilt()?;
        self.require_available()?;
        {
            let mut slot = self.inner.slot.lock();
            slot.targets.tilt = None;
            if slot.targets.position.is_some() {
                self.inner.restart_run(&mut slot);
            } else {
                Inner::cancel_locked(&slot);
            }
        }
        self.send_now(CoverCommand::stop_tilt(self.inner.source_id.clone())).await
    }

    /// Handle a cover service call by name. Values are normalized.
    pub async fn handle_service(
        &self,
        service: &str,
        value: Option<NormalizedValue>,
    ) -> Result<Applied, CoverError> {
        let required = || value.ok_or_else(|| DispatchError::MissingValue(service.to_string()));
        match service {
            "open_cover" => self.open().await,
            "close_cover" => self.close().await,
            "set_cover_position" => self.set_position(required()?).await,
            "stop_cover" => self.stop().await,
            "open_cover_tilt" => self.open_tilt().await,
            "close_cover_tilt" => self.close_tilt().await,
            "set_cover_tilt_position" => self.set_tilt_position(required()?).await,
            "stop_cover_tilt" => self.stop_tilt().await,
            other => Err(DispatchError::NotAllowed(other.to_string()).into()),
        }
    }

    async fn send_now(&self, command: CoverCommand) -> Result<Applied, CoverError> {
        let command = command.with_retry_policy(RetryPolicy::from_settings(&self.inner.options.settings));
        let abort = self.inner.shutdown.child_token();
        match self.inner.dispatcher.dispatch(&command, &abort).await {
            DispatchOutcome::Completed { .. } | DispatchOutcome::Aborted => Ok(Applied::Sent),
            DispatchOutcome::Failed { error, .. } => Err(error.into()),
        }
    }

    /// Wait for the current run, if any, to exit.
    pub async fn wait_idle(&self) {
        loop {
            let pending = {
                let slot = self.inner.slot.lock();
                slot.run.as_ref().map(|r| r.handle.is_finished()) == Some(false)
            };
            if !pending {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Cancel the live run and wait for it to exit. Further commands may
    /// still be issued but any run they start is cancelled at once.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.slot.lock().run.take().map(|r| r.handle);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::debug!(category = "cover", entity = %self.inner.unique_id, "Mapped cover shut down");
    }
}

/// A target needs setting unless it is already the target, or no target is
/// set and the device already reports the value.
fn needs_change(
    target: Option<PhysicalValue>,
    current: Option<PhysicalValue>,
    value: PhysicalValue,
) -> bool {
    match target {
        Some(t) => t != value,
        None => current != Some(value),
    }
}

impl Inner {
    fn source(&self) -> Option<SourceState> {
        self.dispatcher.feed().current(&self.source_id)
    }

    fn is_moving(&self) -> bool {
        self.source().is_some_and(|s| s.is_moving())
            || self
                .dispatcher
                .recently_commanded(&self.source_id, self.options.settings.recent_movement)
    }

    fn cancel_locked(slot: &Slot) {
        if let Some(run) = &slot.run {
            run.token.cancel();
        }
    }

    /// Cancel the run and drop its targets. Nothing drives them once the
    /// run is gone.
    fn abandon_run(&self) {
        let mut slot = self.slot.lock();
        slot.targets = Targets::default();
        Self::cancel_locked(&slot);
    }

    /// Supersede the current run. Must be called with the slot locked.
    fn restart_run(self: &Arc<Self>, slot: &mut Slot) {
        let previous = slot.run.take().map(|run| {
            run.token.cancel();
            run.handle
        });
        let token = self.shutdown.child_token();
        let inner = Arc::clone(self);
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            inner.execute(previous, run_token).await;
        });
        slot.run = Some(RunSlot { token, handle });
        self.stats.lock().started += 1;
    }

    async fn execute(self: Arc<Self>, previous: Option<JoinHandle<()>>, token: CancellationToken) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = self.stats.lock();
            stats.peak_live = stats.peak_live.max(live);
        }

        let targets = self.slot.lock().targets;
        tracing::debug!(
            category = "cover",
            entity = %self.unique_id,
            position = ?targets.position,
            tilt = ?targets.tilt,
            "Convergence run started"
        );
        let outcome = ConvergenceRun::new(
            self.source_id.clone(),
            targets,
            self.options,
            self.dispatcher.clone(),
            token.clone(),
        )
        .run()
        .await;

        self.finish(&token, &outcome);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn finish(&self, token: &CancellationToken, outcome: &RunOutcome) {
        {
            let mut slot = self.slot.lock();
            if !token.is_cancelled() {
                match outcome {
                    RunOutcome::Done { converged } => {
                        for axis in [Axis::Position, Axis::Tilt] {
                            if converged.get(axis).is_some() && slot.targets.get(axis) == converged.get(axis) {
                                slot.targets.set(axis, None);
                            }
                        }
                    }
                    RunOutcome::Failed(_) => slot.targets = Targets::default(),
                    RunOutcome::Aborted => {}
                }
            }
        }

        let mut stats = self.stats.lock();
        match outcome {
            RunOutcome::Done { .. } => {
                stats.completed += 1;
                tracing::debug!(category = "cover", entity = %self.unique_id, "Convergence run done");
            }
            RunOutcome::Aborted => {
                stats.aborted += 1;
                tracing::debug!(category = "cover", entity = %self.unique_id, "Convergence run aborted");
            }
            RunOutcome::Failed(failure) => {
                stats.failed += 1;
                tracing::warn!(
                    category = "cover",
                    entity = %self.unique_id,
                    error = %failure,
                    "Convergence failed, targets cleared"
                );
            }
        }
    }
}
