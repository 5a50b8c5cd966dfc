//! Initialization state machine: the ordered steps and their status.

use serde::{Deserialize, Serialize};

/// Number of steps, including the terminal `Completed`.
pub const STEP_COUNT: usize = 6;

/// The steps of an initialization run, in execution order.
///
/// Progresses linearly: DetectingApp → ObtainingCredential →
/// SelectingWorkDir → DecryptingStore → StartingService → Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    DetectingApp,
    ObtainingCredential,
    SelectingWorkDir,
    DecryptingStore,
    StartingService,
    Completed,
}

impl Step {
    pub const ALL: [Step; STEP_COUNT] = [
        Step::DetectingApp,
        Step::ObtainingCredential,
        Step::SelectingWorkDir,
        Step::DecryptingStore,
        Step::StartingService,
        Step::Completed,
    ];

    /// Ordinal, used to index the step array.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Check if a transition from `self` to `target` is valid.
    ///
    /// Only forward by one step; a retry stays on the same step.
    pub fn can_transition_to(&self, target: Step) -> bool {
        self.next() == Some(target)
    }

    /// Whether this step is terminal (the run is done).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Get the next step in the linear progression, if any.
    pub fn next(&self) -> Option<Step> {
        use Step::*;
        match self {
            DetectingApp => Some(ObtainingCredential),
            ObtainingCredential => Some(SelectingWorkDir),
            SelectingWorkDir => Some(DecryptingStore),
            DecryptingStore => Some(StartingService),
            StartingService => Some(Completed),
            Completed => None,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::DetectingApp => "Detect application",
            Self::ObtainingCredential => "Obtain credential",
            Self::SelectingWorkDir => "Select working directory",
            Self::DecryptingStore => "Decrypt data",
            Self::StartingService => "Start data service",
            Self::Completed => "Done",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::DetectingApp => "Checking that the application is running and locating its data",
            Self::ObtainingCredential => "Reading the data key from the running application",
            Self::SelectingWorkDir => "Choosing where decrypted data is stored",
            Self::DecryptingStore => "Decrypting the application's databases",
            Self::StartingService => "Launching the background data service",
            Self::Completed => "Setup finished",
        }
    }

    pub fn default_weight(&self) -> u32 {
        match self {
            Self::DetectingApp => 10,
            Self::ObtainingCredential => 25,
            Self::SelectingWorkDir => 5,
            Self::DecryptingStore => 40,
            Self::StartingService => 20,
            Self::Completed => 0,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DetectingApp => "detecting_app",
            Self::ObtainingCredential => "obtaining_credential",
            Self::SelectingWorkDir => "selecting_work_dir",
            Self::DecryptingStore => "decrypting_store",
            Self::StartingService => "starting_service",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Relative weight of each step in the overall progress.
///
/// `Completed` always weighs 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepWeights([u32; STEP_COUNT]);

impl StepWeights {
    pub fn new(
        detecting_app: u32,
        obtaining_credential: u32,
        selecting_work_dir: u32,
        decrypting_store: u32,
        starting_service: u32,
    ) -> Self {
        Self([
            detecting_app,
            obtaining_credential,
            selecting_work_dir,
            decrypting_store,
            starting_service,
            0,
        ])
    }

    pub fn get(&self, step: Step) -> u32 {
        self.0[step.index()]
    }
}

impl Default for StepWeights {
    fn default() -> Self {
        Self(Step::ALL.map(|s| s.default_weight()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Success,
    Error,
    WaitingUserInput,
}

impl StepStatus {
    /// Whether a run stopped on a step with this status can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::WaitingUserInput)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
            Self::WaitingUserInput => "waiting_user_input",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step: Step,
    pub status: StepStatus,
    /// 0..=100 within this step.
    pub progress: u8,
    pub error: Option<String>,
    /// What the user must do before a retry, when waiting for input.
    pub user_action: Option<String>,
}

impl StepInfo {
    fn pending(step: Step) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            progress: 0,
            error: None,
            user_action: None,
        }
    }

    fn fraction(&self) -> f64 {
        match self.status {
            StepStatus::Success => 1.0,
            StepStatus::InProgress => f64::from(self.progress.min(100)) / 100.0,
            _ => 0.0,
        }
    }
}

/// Observable state of the orchestrator. Snapshots are clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub current_step: Step,
    /// Indexed by [`Step::index`].
    pub steps: [StepInfo; STEP_COUNT],
    /// 0..=100, weighted across steps.
    pub overall_progress: u8,
    pub is_completed: bool,
    /// True only once the run has completed.
    pub can_exit: bool,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self {
            current_step: Step::DetectingApp,
            steps: Step::ALL.map(StepInfo::pending),
            overall_progress: 0,
            is_completed: false,
            can_exit: false,
        }
    }
}

impl OrchestrationState {
    pub fn step(&self, step: Step) -> &StepInfo {
        &self.steps[step.index()]
    }

    pub fn step_mut(&mut self, step: Step) -> &mut StepInfo {
        &mut self.steps[step.index()]
    }

    /// Recompute `overall_progress` from the step statuses.
    pub fn recompute_progress(&mut self, weights: &StepWeights) {
        self.overall_progress = weighted_progress(
            self.steps
                .iter()
                .map(|info| (weights.get(info.step), info.fraction())),
        );
    }

    /// Mark the run finished.
    pub fn complete(&mut self) {
        self.current_step = Step::Completed;
        let done = self.step_mut(Step::Completed);
        done.status = StepStatus::Success;
        done.progress = 100;
        self.overall_progress = 100;
        self.is_completed = true;
        self.can_exit = true;
    }
}

/// `round(100 × Σ weight×fraction / Σ weight)`, clamped to 0..=100.
pub fn weighted_progress(parts: impl IntoIterator<Item = (u32, f64)>) -> u8 {
    let (done, total) = parts
        .into_iter()
        .fold((0.0_f64, 0.0_f64), |(done, total), (weight, fraction)| {
            let weight = f64::from(weight);
            (done + weight * fraction.clamp(0.0, 1.0), total + weight)
        });
    if total <= 0.0 {
        return 0;
    }
    (100.0 * done / total).round().clamp(0.0, 100.0) as u8
}
