//! Point-in-time captures of aggregate state.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Lifecycle flags of an entity, set by marked events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Set once an archiving event has been applied.
    pub archived: bool,
    /// Set once a deleting event has been applied.
    pub deleted: bool,
}

/// A point-in-time capture of an aggregate's state and version.
///
/// Restoring a snapshot and playing the events recorded after it yields
/// the same state as replaying the full history. Snapshots are also the
/// record shape aggregates are persisted in through
/// [`EntityStorage`](crate::EntityStorage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The aggregate state at the time of the snapshot.
    pub state: A,
    /// Number of state-changing events folded into `state`.
    pub version: u64,
    /// Timestamp of the last state-changing event, in milliseconds since
    /// the Unix epoch. `0` if the aggregate was never modified.
    pub timestamp: u64,
    /// Lifecycle flags at snapshot time.
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::Project;

    #[test]
    fn snapshot_serde_roundtrip() {
        let snap = Snapshot {
            state: Project {
                id: "p-1".into(),
                name: "Apollo".into(),
                tasks: vec!["design".into()],
                started: true,
            },
            version: 3,
            timestamp: 1_700_000_000_000,
            lifecycle: Lifecycle {
                archived: true,
                deleted: false,
            },
        };

        let json = serde_json::to_string(&snap).expect("serialization should succeed");
        let back: Snapshot<Project> = serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, snap);
    }

    #[test]
    fn missing_lifecycle_defaults_to_active() {
        let json = r#"{"state":{"id":"p-1","name":"","tasks":[],"started":false},"version":1,"timestamp":5}"#;
        let snap: Snapshot<Project> = serde_json::from_str(json).expect("deserialization should succeed");
        assert_eq!(snap.lifecycle, Lifecycle::default());
    }
}
