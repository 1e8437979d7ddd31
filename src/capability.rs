//! The closed set of optional features a server declares at connect time.
//!
//! Modeled as tagged variants rather than strings scattered through control
//! flow (design note in spec §9): every gated operation checks membership
//! in a [`CapabilitySet`] at its entry boundary.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A single optional protocol feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    ClientPublish,
    Parameters,
    ParametersSubscribe,
    Time,
    Services,
    ConnectionGraph,
    Assets,
}

impl Capability {
    /// The wire token for this capability, as it appears in `serverInfo`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ClientPublish => "clientPublish",
            Capability::Parameters => "parameters",
            Capability::ParametersSubscribe => "parametersSubscribe",
            Capability::Time => "time",
            Capability::Services => "services",
            Capability::ConnectionGraph => "connectionGraph",
            Capability::Assets => "assets",
        }
    }

    /// Parses a `serverInfo.capabilities` wire token. Unrecognized tokens
    /// (a newer server's feature this client doesn't know about) are
    /// `None`, not an error.
    pub fn from_wire_token(token: &str) -> Option<Self> {
        match token {
            "clientPublish" => Some(Capability::ClientPublish),
            "parameters" => Some(Capability::Parameters),
            "parametersSubscribe" => Some(Capability::ParametersSubscribe),
            "time" => Some(Capability::Time),
            "services" => Some(Capability::Services),
            "connectionGraph" => Some(Capability::ConnectionGraph),
            "assets" => Some(Capability::Assets),
            _ => None,
        }
    }
}

/// The capabilities a server (or, from the client's view, a peer server)
/// has declared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySet(HashSet<Capability>);

impl CapabilitySet {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self(capabilities.into_iter().collect())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn as_wire_tokens(&self) -> Vec<String> {
        self.0.iter().map(|c| c.as_str().to_owned()).collect()
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    /// Builds a set from a `serverInfo.capabilities` token list, silently
    /// dropping anything this client doesn't recognize.
    pub fn from_wire_tokens<S: AsRef<str>>(tokens: impl IntoIterator<Item = S>) -> Self {
        Self(
            tokens
                .into_iter()
                .filter_map(|t| Capability::from_wire_token(t.as_ref()))
                .collect(),
        )
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tokens_match_spec_names() {
        let set = CapabilitySet::new([Capability::Services, Capability::Time]);
        let mut tokens = set.as_wire_tokens();
        tokens.sort();
        assert_eq!(tokens, vec!["services".to_string(), "time".to_string()]);
    }

    #[test]
    fn contains_is_gating_check() {
        let set = CapabilitySet::new([Capability::Assets]);
        assert!(set.contains(Capability::Assets));
        assert!(!set.contains(Capability::Services));
    }

    #[test]
    fn unrecognized_wire_tokens_are_dropped_not_errors() {
        let set = CapabilitySet::from_wire_tokens(["time", "somethingFromTheFuture"]);
        assert!(set.contains(Capability::Time));
        assert_eq!(set.as_wire_tokens(), vec!["time".to_string()]);
    }
}
