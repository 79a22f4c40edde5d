//! Install pipeline steps.
//!
//! A worker install is a strictly ordered sequence of steps. Each step has an
//! on-disk precondition that, when already satisfied, lets the pipeline skip
//! it, so a partially completed install resumes where it stopped.

use std::fmt;

use serde::Serialize;

use crate::layout::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    Clone,
    CreateEnv,
    UpgradeTools,
    HeavyDeps,
    Requirements,
    Extras,
}

impl InstallStep {
    pub const ALL: [InstallStep; 6] = [
        InstallStep::Clone,
        InstallStep::CreateEnv,
        InstallStep::UpgradeTools,
        InstallStep::HeavyDeps,
        InstallStep::Requirements,
        InstallStep::Extras,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::CreateEnv => "create_env",
            Self::UpgradeTools => "upgrade_tools",
            Self::HeavyDeps => "heavy_deps",
            Self::Requirements => "requirements",
            Self::Extras => "extras",
        }
    }

    /// State reached once this step has completed.
    /// Whether the on-disk artifact of this step already exists.
    ///
    /// Clone and environment creation are detected from the directories
    /// they produce; the package steps leave a stamp file inside the
    /// environment once they succeed.
    pub fn is_satisfied(self, layout: &Layout, worker: &str) -> bool {
        match self {
            Self::Clone => layout.has_clone(worker),
            Self::CreateEnv => layout.has_env(worker),
            step => layout.has_stamp(worker, step),
        }
    }

    /// First step whose precondition does not hold yet, or `None` when the
    /// install is complete.
    pub fn resume_point(layout: &Layout, worker: &str) -> Option<InstallStep> {
        Self::ALL
            .into_iter()
            .find(|step| !step.is_satisfied(layout, worker))
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
