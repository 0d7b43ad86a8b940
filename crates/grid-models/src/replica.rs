use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicaState {
    Available,
    Unavailable,
    Copying,
    BeingDeleted,
    Bad,
    Source,
    TemporaryUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub scope: String,
    pub name: String,
    pub rse_id: uuid::Uuid,
    pub bytes: i64,
    pub state: ReplicaState,
    pub tombstone: Option<DateTime<Utc>>,
    pub locked_count: i64,
    pub path: Option<String>,
}

impl Replica {
    pub fn is_unlocked(&self) -> bool {
        self.locked_count == 0
    }

    /// A replica is reapable when unlocked with a tombstone at or before `now`.
    pub fn is_reapable(&self, now: DateTime<Utc>) -> bool {
        self.is_unlocked() && self.tombstone.is_some_and(|ts| ts <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(locked_count: i64, tombstone: Option<DateTime<Utc>>) -> Replica {
        Replica {
            scope: "mc16".into(),
            name: "file001".into(),
            rse_id: uuid::Uuid::nil(),
            bytes: 1024,
            state: ReplicaState::Available,
            tombstone,
            locked_count,
            path: None,
        }
    }

    #[test]
    fn locked_replica_is_never_reapable() {
        let now = Utc::now();
        let r = replica(1, Some(now - chrono::Duration::days(1)));
        assert!(!r.is_unlocked());
        assert!(!r.is_reapable(now));
    }

    #[test]
    fn unlocked_future_tombstone_is_not_reapable() {
        let now = Utc::now();
        let r = replica(0, Some(now + chrono::Duration::days(1)));
        assert!(!r.is_reapable(now));
    }

    #[test]
    fn unlocked_expired_tombstone_is_reapable() {
        let now = Utc::now();
        let r = replica(0, Some(now - chrono::Duration::seconds(1)));
        assert!(r.is_reapable(now));
    }

    #[test]
    fn no_tombstone_is_not_reapable() {
        let now = Utc::now();
        let r = replica(0, None);
        assert!(!r.is_reapable(now));
    }
}
