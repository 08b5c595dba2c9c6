//! Stable conversation identity scoped to a clinical entity.

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::backend::HistoryScope;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub feature: String,
    pub entity_id: String,
    pub sub_entity_id: Option<String>,
    pub epoch: u64,
}

impl SessionKey {
    pub fn scope(&self) -> HistoryScope {
        HistoryScope {
            feature: self.feature.clone(),
            entity_id: self.entity_id.clone(),
            sub_entity_id: self.sub_entity_id.clone(),
        }
    }

    /// True when both keys address the same entity tuple, whatever the epoch.
    pub fn same_entity(&self, other: &SessionKey) -> bool {
        self.feature == other.feature
            && self.entity_id == other.entity_id
            && self.sub_entity_id == other.sub_entity_id
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.feature, self.entity_id)?;
        if let Some(sub) = &self.sub_entity_id {
            write!(f, ":{}", sub)?;
        }
        write!(f, "#{}", self.epoch)
    }
}

type EntityTuple = (String, String, Option<String>);

/// Issues session keys. Keys only change when the entity tuple changes or
/// when [`SessionIdentity::reset_session`] bumps the tuple's epoch.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    epochs: DashMap<EntityTuple, u64>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    fn tuple(feature: &str, entity_id: &str, sub_entity_id: Option<&str>) -> EntityTuple {
        (
            feature.to_string(),
            entity_id.to_string(),
            sub_entity_id.map(str::to_string),
        )
    }

    pub fn derive_key(&self, feature: &str, entity_id: &str, sub_entity_id: Option<&str>) -> SessionKey {
        let tuple = Self::tuple(feature, entity_id, sub_entity_id);
        let epoch = self.epochs.get(&tuple).map(|e| *e).unwrap_or(0);
        SessionKey {
            feature: tuple.0,
            entity_id: tuple.1,
            sub_entity_id: tuple.2,
            epoch,
        }
    }

    /// Bump the tuple's epoch and return the fresh key.
    pub fn reset_session(&self, feature: &str, entity_id: &str, sub_entity_id: Option<&str>) -> SessionKey {
        let tuple = Self::tuple(feature, entity_id, sub_entity_id);
        let epoch = {
            let mut entry = self.epochs.entry(tuple.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let key = SessionKey {
            feature: tuple.0,
            entity_id: tuple.1,
            sub_entity_id: tuple.2,
            epoch,
        };
        debug!("Session reset, new key {}", key);
        key
    }
}
