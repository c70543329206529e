//! Per-component health of a Hubble installation

use std::fmt;

/// Health of one component (relay or UI)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Object missing or not yet observed
    Unknown,
    /// Rollout in progress
    Progressing,
    /// All desired replicas available
    Ready,
    /// Rollout failed with the given reason
    Failed(String),
}

impl ComponentStatus {
    /// Ready and Failed are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// Health of every enabled component. `None` means the component is not enabled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallationStatus {
    /// Relay status
    pub relay: Option<ComponentStatus>,
    /// UI status
    pub ui: Option<ComponentStatus>,
}

impl InstallationStatus {
    /// Status for the given enabled components, all `Unknown`
    pub fn unknown(relay: bool, ui: bool) -> Self {
        Self {
            relay: relay.then_some(ComponentStatus::Unknown),
            ui: ui.then_some(ComponentStatus::Unknown),
        }
    }

    /// Enabled components paired with their name
    pub fn components(&self) -> impl Iterator<Item = (&'static str, &ComponentStatus)> {
        [("relay", self.relay.as_ref()), ("ui", self.ui.as_ref())]
            .into_iter()
            .filter_map(|(name, s)| s.map(|s| (name, s)))
    }

    /// Every enabled component is Ready
    pub fn all_ready(&self) -> bool {
        self.components().all(|(_, s)| *s == ComponentStatus::Ready)
    }

    /// First failed component and its reason
    pub fn first_failure(&self) -> Option<(&'static str, &str)> {
        self.components().find_map(|(name, s)| match s {
            ComponentStatus::Failed(reason) => Some((name, reason.as_str())),
            _ => None,
        })
    }
}

impl fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .components()
            .map(|(name, s)| format!("{}={}", name, s))
            .collect();
        if parts.is_empty() {
            write!(f, "no components enabled")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_components_are_ignored() {
        let status = InstallationStatus {
            relay: Some(ComponentStatus::Ready),
            ui: None,
        };
        assert!(status.all_ready());
        assert_eq!(status.to_string(), "relay=Ready");
    }

    #[test]
    fn failure_is_reported_with_component() {
        let status = InstallationStatus {
            relay: Some(ComponentStatus::Ready),
            ui: Some(ComponentStatus::Failed("ReplicaFailure".into())),
        };
        assert!(!status.all_ready());
        assert_eq!(status.first_failure(), Some(("ui", "ReplicaFailure")));
        assert_eq!(status.to_string(), "relay=Ready, ui=Failed(ReplicaFailure)");
    }

    #[test]
    fn unknown_status_for_enabled_components() {
        let status = InstallationStatus::unknown(true, false);
        assert_eq!(status.relay, Some(ComponentStatus::Unknown));
        assert!(status.ui.is_none());
        assert!(!status.relay.as_ref().map(|s| s.is_terminal()).unwrap_or(true));
        assert_eq!(
            InstallationStatus::default().to_string(),
            "no components enabled"
        );
    }
}
