//! Convergence controller.
//!
//! A [`ConvergenceRun`] drives one source cover toward a snapshot of the
//! facade's targets. It is an explicit state machine:
//!
//! ```text
//! Start -> MaybeStopIfAtTarget -> SequenceAxes -> IssuePosition -> IssueTilt -> Done
//!                    |                                                 ^
//!                    +------------------ tilt pending ----------------+
//! ```
//!
//! Any state may end in `Aborted` (the run's token was cancelled) or
//! `Failed` (device unavailable, or a command ran out of retries). The
//! token is checked before every dispatch and at every suspension point.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mappedcover_commands::{
    CommandDispatcher, CoverCommand, DispatchFailure, DispatchOutcome, RetryPolicy,
};
use mappedcover_core::{
    Attribute, Axis, ControllerSettings, PhysicalValue, SourceId, SourceState,
};
use mappedcover_devices::{wait_for_attribute, AttributeWait, ServiceAction, WaitOutcome};

/// Per-axis physical targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct Targets {
    pub position: Option<PhysicalValue>,
    pub tilt: Option<PhysicalValue>,
}

impl Targets {
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.tilt.is_none()
    }

    pub fn get(&self, axis: Axis) -> Option<PhysicalValue> {
        match axis {
            Axis::Position => self.position,
            Axis::Tilt => self.tilt,
        }
    }

    pub fn set(&mut self, axis: Axis, value: Option<PhysicalValue>) {
        match axis {
            Axis::Position => self.position = value,
            Axis::Tilt => self.tilt = value,
        }
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunFailure {
    #[error("source device is unavailable")]
    Unavailable,

    #[error("{action} failed: {error}")]
    Dispatch {
        action: ServiceAction,
        error: DispatchFailure,
    },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every targeted axis converged
    Done { converged: Targets },
    Aborted,
    Failed(RunFailure),
}

/// Controller states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Start,
    MaybeStopIfAtTarget,
    SequenceAxes,
    IssuePosition,
    IssueTilt,
    Done,
    Aborted,
    Failed(RunFailure),
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Start => "start",
            RunState::MaybeStopIfAtTarget => "maybe_stop_if_at_target",
            RunState::SequenceAxes => "sequence_axes",
            RunState::IssuePosition => "issue_position",
            RunState::IssueTilt => "issue_tilt",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
            RunState::Failed(_) => "failed",
        }
    }
}

/// Per-run options taken from the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub close_tilt_if_down: bool,
    pub settings: ControllerSettings,
}

/// One cancellable convergence attempt.
pub struct ConvergenceRun {
    device_id: SourceId,
    targets: Targets,
    options: RunOptions,
    dispatcher: Arc<CommandDispatcher>,
    abort: CancellationToken,
    /// A position command completed in this run
    moved: bool,
}

impl ConvergenceRun {
    pub fn new(
        device_id: impl Into<SourceId>,
        targets: Targets,
        options: RunOptions,
        dispatcher: Arc<CommandDispatcher>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            targets,
            options,
            dispatcher,
            abort,
            moved: false,
        }
    }

    /// Drive the state machine to a terminal state.
    pub async fn run(mut self) -> RunOutcome {
        let mut state = RunState::Start;
        loop {
            let next = match &state {
                RunState::Start => self.start(),
                RunState::MaybeStopIfAtTarget => self.maybe_stop_if_at_target().await,
                RunState::SequenceAxes => self.sequence_axes().await,
                RunState::IssuePosition => self.issue_position().await,
                RunState::IssueTilt => self.issue_tilt().await,
                RunState::Done => {
                    return RunOutcome::Done {
                        converged: self.targets,
                    }
                }
                RunState::Aborted => return RunOutcome::Aborted,
                RunState::Failed(failure) => return RunOutcome::Failed(failure.clone()),
            };
            tracing::trace!(
                category = "cover",
                device = %self.device_id,
                from = state.name(),
                to = next.name(),
                "Controller transition"
            );
            state = next;
        }
    }

    fn snapshot(&self) -> Option<SourceState> {
        self.dispatcher.feed().current(&self.device_id)
    }

    fn current(&self, attribute: Attribute) -> Option<PhysicalValue> {
        self.snapshot().and_then(|s| s.attribute(attribute))
    }

    fn within_tolerance(&self, value: Option<PhysicalValue>, target: PhysicalValue) -> bool {
        value.is_some_and(|v| v.abs_diff(target) <= self.options.settings.tolerance)
    }

    fn is_moving(&self) -> bool {
        self.snapshot().is_some_and(|s| s.is_moving())
            || self
                .dispatcher
                .recently_commanded(&self.device_id, self.options.settings.recent_movement)
    }

    fn tilt_pending(&self) -> bool {
        self.targets
            .tilt
            .is_some_and(|t| !self.within_tolerance(self.current(Attribute::CurrentTiltPosition), t))
    }

    fn retrying(&self, command: CoverCommand) -> CoverCommand {
        command
            .with_retry_policy(RetryPolicy::from_settings(&self.options.settings))
            .with_confirmation()
    }

    /// Send a command, mapping the outcome to the next state on failure.
    async fn send(&self, command: CoverCommand) -> Result<(), RunState> {
        if self.abort.is_cancelled() {
            return Err(RunState::Aborted);
        }
        let action = command.action;
        match self.dispatcher.dispatch(&command, &self.abort).await {
            DispatchOutcome::Completed { .. } => Ok(()),
            DispatchOutcome::Aborted => Err(RunState::Aborted),
            DispatchOutcome::Failed { error, .. } => {
                Err(RunState::Failed(RunFailure::Dispatch { action, error }))
            }
        }
    }

    fn start(&self) -> RunState {
        if self.abort.is_cancelled() {
            return RunState::Aborted;
        }
        if !self.snapshot().is_some_and(|s| s.is_available()) {
            return RunState::Failed(RunFailure::Unavailable);
        }
        RunState::MaybeStopIfAtTarget
    }

    async fn maybe_stop_if_at_target(&self) -> RunState {
        let Some(target) = self.targets.position else {
            return RunState::SequenceAxes;
        };
        if !self.is_moving() || !self.within_tolerance(self.current(Attribute::CurrentPosition), target) {
            return RunState::SequenceAxes;
        }

        tracing::debug!(
            category = "cover",
            device = %self.device_id,
            target,
            "Moving but already at target, stopping"
        );
        let stop = CoverCommand::stop(self.device_id.clone()).with_retry_policy(RetryPolicy {
            retries: 0,
            ..RetryPolicy::from_settings(&self.options.settings)
        });
        match self.send(stop).await {
            // A failed stop leaves the cover at the target anyway
            Ok(()) | Err(RunState::Failed(_)) => {}
            Err(state) => return state,
        }

        if self.tilt_pending() {
            RunState::IssueTilt
        } else {
            RunState::Done
        }
    }

    async fn sequence_axes(&self) -> RunState {
        let (Some(position), Some(tilt)) = (self.targets.position, self.targets.tilt) else {
            return RunState::IssuePosition;
        };
        let current = self.current(Attribute::CurrentPosition);
        if self.within_tolerance(current, position) || self.is_moving() {
            return RunState::IssuePosition;
        }

        let going_down = current.is_some_and(|c| position < c);
        let safe_tilt = if self.options.close_tilt_if_down && going_down {
            0
        } else {
            tilt
        };
        tracing::debug!(
            category = "cover",
            device = %self.device_id,
            tilt = safe_tilt,
            position,
            "Setting tilt before position"
        );
        let command = self.retrying(CoverCommand::set_tilt_position(self.device_id.clone(), safe_tilt));
        match self.send(command).await {
            Ok(()) => RunState::IssuePosition,
            Err(state) => state,
        }
    }

    async fn issue_position(&mut self) -> RunState {
        let Some(position) = self.targets.position else {
            return RunState::IssueTilt;
        };
        if self.within_tolerance(self.current(Attribute::CurrentPosition), position) {
            return RunState::IssueTilt;
        }

        let command = self.retrying(CoverCommand::set_position(self.device_id.clone(), position));
        match self.send(command).await {
            Ok(()) => {
                self.moved = true;
                RunState::IssueTilt
            }
            Err(state) => state,
        }
    }

    async fn issue_tilt(&self) -> RunState {
        let Some(tilt) = self.targets.tilt else {
            return RunState::Done;
        };
        if self.abort.is_cancelled() {
            return RunState::Aborted;
        }
        let current = self.current(Attribute::CurrentTiltPosition);
        if !self.moved && self.within_tolerance(current, tilt) {
            return RunState::Done;
        }

        // Close the slats first when lowering tilt on its own
        let lowering = current.is_some_and(|c| tilt < c);
        if self.options.close_tilt_if_down && self.targets.position.is_none() && lowering && tilt > 0 {
            let command = self.retrying(CoverCommand::set_tilt_position(self.device_id.clone(), 0));
            if let Err(state) = self.send(command).await {
                return state;
            }
        }

        if self.moved {
            let settle = AttributeWait::new(self.device_id.clone(), Attribute::CurrentTiltPosition, tilt)
                .with_tolerance(self.options.settings.tolerance)
                .with_timeout(self.options.settings.tilt_settle);
            match wait_for_attribute(self.dispatcher.feed(), &settle, &self.abort).await {
                WaitOutcome::Reached => return RunState::Done,
                WaitOutcome::Aborted => return RunState::Aborted,
                WaitOutcome::TimedOut => {}
            }
        }

        let command = self.retrying(CoverCommand::set_tilt_position(self.device_id.clone(), tilt));
        match self.send(command).await {
            Ok(()) => RunState::Done,
            Err(state) => state,
        }
    }
}
