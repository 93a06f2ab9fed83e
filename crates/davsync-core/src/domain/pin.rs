//! Pin states and availability for virtual files

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Per-path policy controlling automatic hydration and dehydration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    /// Follow the closest ancestor with an explicit pin.
    #[default]
    Inherited,
    /// Keep hydrated; schedule hydration eagerly.
    AlwaysLocal,
    /// Keep dehydrated; schedule dehydration after successful sync.
    OnlineOnly,
    /// No policy recorded.
    Unspecified,
}

impl PinState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinState::Inherited => "inherited",
            PinState::AlwaysLocal => "always_local",
            PinState::OnlineOnly => "online_only",
            PinState::Unspecified => "unspecified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inherited" => Some(PinState::Inherited),
            "always_local" => Some(PinState::AlwaysLocal),
            "online_only" => Some(PinState::OnlineOnly),
            "unspecified" => Some(PinState::Unspecified),
            _ => None,
        }
    }
}

impl Display for PinState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hydration summary over a path and its descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    AllHydrated,
    AllDehydrated,
    AlwaysLocal,
    OnlineOnly,
    Mixed,
}

impl Availability {
    /// Folds two subtree summaries into one.
    pub fn combine(self, other: Availability) -> Availability {
        use Availability::*;
        if self == other {
            return self;
        }
        match (self, other) {
            (AlwaysLocal, AllHydrated) | (AllHydrated, AlwaysLocal) => AllHydrated,
            (OnlineOnly, AllDehydrated) | (AllDehydrated, OnlineOnly) => AllDehydrated,
            _ => Mixed,
        }
    }
}
