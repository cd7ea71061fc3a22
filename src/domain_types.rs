//! Domain types for the Corral orchestration kernel
//!
//! This module defines strongly-typed domain values to prevent primitive obsession
//! and improve type safety throughout the codebase.

use nutype::nutype;
use std::time::Duration;
use uuid::Uuid;

/// Name of an agent on the bus. Doubles as the scoping key for the backlog.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 64, predicate = |name| {
        name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct AgentName(String);

/// Opaque bus-assigned message identifier, unique within the bus.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct MessageId(String);

/// Unique identifier for a launched agent runtime.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct RuntimeId(Uuid);

impl RuntimeId {
    /// Creates a new random runtime ID.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier of a deployment group in the deployments file.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct GroupId(String);

/// Maximum number of messages one processing cycle may consume: the claimed
/// trigger plus up to `BatchSize - 1` drained context messages.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into
    )
)]
pub struct BatchSize(usize);

impl BatchSize {
    /// Default batch size used when the operator does not override it.
    ///
    /// # Panics
    ///
    /// Never panics; 10 is within the validated range.
    #[must_use]
    pub fn standard() -> Self {
        Self::try_new(10).expect("10 is a valid batch size")
    }

    /// Number of additional pending messages to drain after a claim.
    #[must_use]
    pub fn drain_limit(&self) -> usize {
        self.into_inner().saturating_sub(1)
    }
}

/// Number of completed messages handed to the handler as conversation history.
#[nutype(
    validate(less_or_equal = 500),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 25
)]
pub struct HistoryLimit(usize);

/// Interval between liveness pings to the bus. Zero disables the heartbeat.
#[nutype(
    validate(less_or_equal = 3600),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default, TryFrom, Into
    ),
    default = 240
)]
pub struct HeartbeatSeconds(u64);

impl HeartbeatSeconds {
    /// Whether the heartbeat is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.into_inner() == 0
    }

    /// The interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_name_accepts_common_identifiers() {
        assert!(AgentName::try_new("alpha".to_string()).is_ok());
        assert!(AgentName::try_new("agent-7_dev".to_string()).is_ok());
    }

    #[test]
    fn agent_name_rejects_empty_and_spaced_names() {
        assert!(AgentName::try_new("".to_string()).is_err());
        assert!(AgentName::try_new("   ".to_string()).is_err());
        assert!(AgentName::try_new("two words".to_string()).is_err());
        assert!(AgentName::try_new("a@b".to_string()).is_err());
    }

    #[test]
    fn agent_name_trims_surrounding_whitespace() {
        let name = AgentName::try_new("  alpha  ".to_string()).unwrap();
        assert_eq!(name.as_str(), "alpha");
    }

    #[test]
    fn message_id_rejects_empty() {
        assert!(MessageId::try_new("".to_string()).is_err());
        assert!(MessageId::try_new("msg-001".to_string()).is_ok());
    }

    #[test]
    fn batch_size_drain_limit_is_one_less() {
        assert_eq!(BatchSize::standard().drain_limit(), 9);
        assert_eq!(BatchSize::try_new(1).unwrap().drain_limit(), 0);
    }

    #[test]
    fn heartbeat_zero_is_disabled() {
        assert!(HeartbeatSeconds::try_new(0).unwrap().is_disabled());
        assert!(!HeartbeatSeconds::default().is_disabled());
        assert_eq!(
            HeartbeatSeconds::default().interval(),
            Duration::from_secs(240)
        );
    }

    #[test]
    fn runtime_ids_are_unique() {
        assert_ne!(RuntimeId::generate(), RuntimeId::generate());
    }
}
