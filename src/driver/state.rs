use std::fmt;

use serde::{Deserialize, Serialize};

/// Events fed to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Activate,
    Deactivate,
    Success,
    Failure,
    Spaghetti,
    Tick,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Activate => write!(f, "ACTIVATE"),
            Action::Deactivate => write!(f, "DEACTIVATE"),
            Action::Success => write!(f, "SUCCESS"),
            Action::Failure => write!(f, "FAILURE"),
            Action::Spaghetti => write!(f, "SPAGHETTI"),
            Action::Tick => write!(f, "TICK"),
        }
    }
}

/// Coarse printer state reported alongside every action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrinterState {
    Idle,
    Paused,
    Busy,
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrinterState::Idle => write!(f, "IDLE"),
            PrinterState::Paused => write!(f, "PAUSED"),
            PrinterState::Busy => write!(f, "BUSY"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusType {
    #[default]
    Normal,
    NeedsAction,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Inactive,
    Activating,
    Idle,
    Preprint,
    StartPrint { run_pre_script: bool },
    AwaitingMaterial,
    Printing,
    Paused,
    SpaghettiRecovery,
    Failure,
    Success,
    StartClearing,
    Cooldown,
    Clearing,
    StartFinishing,
    Finishing,
}

impl DriverState {
    pub fn name(&self) -> &'static str {
        match self {
            DriverState::Inactive => "inactive",
            DriverState::Activating => "activating",
            DriverState::Idle => "idle",
            DriverState::Preprint => "preprint",
            DriverState::StartPrint { .. } => "start_print",
            DriverState::AwaitingMaterial => "awaiting_material",
            DriverState::Printing => "printing",
            DriverState::Paused => "paused",
            DriverState::SpaghettiRecovery => "spaghetti_recovery",
            DriverState::Failure => "failure",
            DriverState::Success => "success",
            DriverState::StartClearing => "start_clearing",
            DriverState::Cooldown => "cooldown",
            DriverState::Clearing => "clearing",
            DriverState::StartFinishing => "start_finishing",
            DriverState::Finishing => "finishing",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side-channel printer data that may accompany an action. Absent fields
/// leave the previously reported value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub materials: Vec<Option<String>>,
    #[serde(default)]
    pub bed_temp: Option<f64>,
}

impl Telemetry {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Whether the loaded materials satisfy a set's requirements.
///
/// Compared per tool index: every constrained tool must hold exactly the
/// required material; `None` leaves a tool unconstrained.
pub fn materials_match(required: &[Option<String>], loaded: &[Option<String>]) -> bool {
    first_mismatch(required, loaded).is_none()
}

/// Index and required material of the first unsatisfied tool.
pub fn first_mismatch<'a>(
    required: &'a [Option<String>],
    loaded: &[Option<String>],
) -> Option<(usize, &'a str)> {
    required.iter().enumerate().find_map(|(tool, req)| {
        let req = req.as_deref()?;
        let have = loaded.get(tool).and_then(|m| m.as_deref());
        (have != Some(req)).then_some((tool, req))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mats(v: &[Option<&str>]) -> Vec<Option<String>> {
        v.iter().map(|m| m.map(str::to_string)).collect()
    }

    #[test]
    fn test_materials_match_per_tool() {
        let required = mats(&[None, Some("toolB")]);
        assert!(!materials_match(&required, &mats(&[Some("toolA"), Some("toolC")])));
        assert!(materials_match(&required, &mats(&[Some("toolA"), Some("toolB")])));
        // Order matters, not membership
        assert!(!materials_match(&required, &mats(&[Some("toolB"), Some("toolA")])));
    }

    #[test]
    fn test_materials_unconstrained() {
        assert!(materials_match(&[], &[]));
        assert!(materials_match(&mats(&[None, None]), &[]));
    }

    #[test]
    fn test_missing_tool_does_not_match() {
        let required = mats(&[Some("PLA")]);
        assert!(!materials_match(&required, &[]));
        assert_eq!(first_mismatch(&required, &mats(&[None])), Some((0, "PLA")));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(DriverState::StartPrint { run_pre_script: false }.to_string(), "start_print");
        assert_eq!(DriverState::SpaghettiRecovery.name(), "spaghetti_recovery");
    }

    #[test]
    fn test_action_wire_names() {
        let a: Action = serde_json::from_str("\"SPAGHETTI\"").unwrap();
        assert_eq!(a, Action::Spaghetti);
        assert_eq!(serde_json::to_string(&PrinterState::Busy).unwrap(), "\"BUSY\"");
        assert_eq!(serde_json::to_string(&StatusType::NeedsAction).unwrap(), "\"NEEDS_ACTION\"");
    }
}
