//! Allocation decisions

use std::fmt;

/// Verdict of a decider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionType {
    /// The copy must not be placed (or stay) on the node
    No,
    /// Allowed in principle, but not right now
    Throttle,
    Yes,
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionType::No => write!(f, "NO"),
            DecisionType::Throttle => write!(f, "THROTTLE"),
            DecisionType::Yes => write!(f, "YES"),
        }
    }
}

/// A decision from one decider, or the combined decisions of a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Single {
        kind: DecisionType,
        /// Name of the decider that produced it
        label: Option<&'static str>,
        explanation: Option<String>,
    },
    Multi(Vec<Decision>),
}

impl Decision {
    pub const YES: Decision = Decision::Single {
        kind: DecisionType::Yes,
        label: None,
        explanation: None,
    };

    pub const NO: Decision = Decision::Single {
        kind: DecisionType::No,
        label: None,
        explanation: None,
    };

    pub const THROTTLE: Decision = Decision::Single {
        kind: DecisionType::Throttle,
        label: None,
        explanation: None,
    };

    pub fn single(kind: DecisionType, label: &'static str, explanation: impl Into<String>) -> Self {
        Decision::Single {
            kind,
            label: Some(label),
            explanation: Some(explanation.into()),
        }
    }

    /// Effective verdict. For a chain: any NO wins, then any THROTTLE,
    /// otherwise YES.
    pub fn kind(&self) -> DecisionType {
        match self {
            Decision::Single { kind, .. } => *kind,
            Decision::Multi(decisions) => {
                let mut result = DecisionType::Yes;
                for decision in decisions {
                    match decision.kind() {
                        DecisionType::No => return DecisionType::No,
                        DecisionType::Throttle => result = DecisionType::Throttle,
                        DecisionType::Yes => {}
                    }
                }
                result
            }
        }
    }

    pub fn label(&self) -> Option<&'static str> {
        match self {
            Decision::Single { label, .. } => *label,
            Decision::Multi(_) => None,
        }
    }

    pub fn explanation(&self) -> Option<&str> {
        match self {
            Decision::Single { explanation, .. } => explanation.as_deref(),
            Decision::Multi(_) => None,
        }
    }

    /// Nested decisions of a chain (a single decision yields itself)
    pub fn decisions(&self) -> Vec<&Decision> {
        match self {
            Decision::Single { .. } => vec![self],
            Decision::Multi(decisions) => decisions.iter().flat_map(|d| d.decisions()).collect(),
        }
    }

    /// First nested decision with the given verdict
    pub fn find(&self, kind: DecisionType) -> Option<&Decision> {
        self.decisions().into_iter().find(|d| d.kind() == kind)
    }

    pub fn is_yes(&self) -> bool {
        self.kind() == DecisionType::Yes
    }

    pub fn is_no(&self) -> bool {
        self.kind() == DecisionType::No
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Single {
                kind,
                label,
                explanation,
            } => {
                write!(f, "[{}", kind)?;
                if let Some(label) = label {
                    write!(f, "({})", label)?;
                }
                if let Some(explanation) = explanation {
                    write!(f, ": {}", explanation)?;
                }
                write!(f, "]")
            }
            Decision::Multi(decisions) => {
                for (i, decision) in decisions.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", decision)?;
                }
                Ok(())
            }
        }
    }
}
