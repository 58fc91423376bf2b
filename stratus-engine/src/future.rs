//! Persisted records of in-flight remote operations.
//!
//! A [`Future`] lives in the owning object's status, so it survives process
//! restarts together with the object. At most one future exists per
//! (resource name, service, kind).

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Kind of long-running operation a future tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FutureKind {
    Put,
    Delete,
    /// A kind written by something other than this engine.
    Unknown(String),
}

impl FutureKind {
    pub fn as_str(&self) -> &str {
        match self {
            FutureKind::Put => "PUT",
            FutureKind::Delete => "DELETE",
            FutureKind::Unknown(kind) => kind,
        }
    }
}

impl From<String> for FutureKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "PUT" => FutureKind::Put,
            "DELETE" => FutureKind::Delete,
            _ => FutureKind::Unknown(kind),
        }
    }
}

impl From<FutureKind> for String {
    fn from(kind: FutureKind) -> Self {
        match kind {
            FutureKind::Unknown(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for FutureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-flight remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Future {
    #[serde(rename = "type")]
    pub kind: FutureKind,
    /// Identifier of the owning service, e.g. "privateendpoints".
    pub service_name: String,
    pub name: String,
    pub resource_group: String,
    /// Base64 (URL alphabet) encoded SDK resume token.
    pub data: String,
}

impl Future {
    fn matches(&self, name: &str, service_name: &str, kind: &FutureKind) -> bool {
        self.name == name && self.service_name == service_name && &self.kind == kind
    }
}

/// Storage for long-running operation state.
///
/// Implemented by the status of the top-level object; the host runtime
/// persists it with its next status write. The store never evicts on its own.
pub trait FutureStore {
    /// All futures of one resource for one service, whatever their kind.
    fn futures_for(&self, name: &str, service_name: &str) -> Vec<&Future>;

    fn get_future(&self, name: &str, service_name: &str, kind: &FutureKind) -> Option<&Future> {
        self.futures_for(name, service_name)
            .into_iter()
            .find(|f| &f.kind == kind)
    }

    /// Insert or replace the future with the same key.
    fn set_future(&mut self, future: Future);

    fn delete_future(&mut self, name: &str, service_name: &str, kind: &FutureKind);

    /// When the current reconcile has to hand control back.
    ///
    /// Operations still running at that point are stored rather than awaited.
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

impl FutureStore for Vec<Future> {
    fn futures_for(&self, name: &str, service_name: &str) -> Vec<&Future> {
        self.iter()
            .filter(|f| f.name == name && f.service_name == service_name)
            .collect()
    }

    fn set_future(&mut self, future: Future) {
        match self
            .iter_mut()
            .find(|f| f.matches(&future.name, &future.service_name, &future.kind))
        {
            Some(existing) => *existing = future,
            None => self.push(future),
        }
    }

    fn delete_future(&mut self, name: &str, service_name: &str, kind: &FutureKind) {
        self.retain(|f| !f.matches(name, service_name, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn future(name: &str, service: &str, kind: FutureKind, data: &str) -> Future {
        Future {
            kind,
            service_name: service.to_string(),
            name: name.to_string(),
            resource_group: "g1".to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_set_replaces_same_key() {
        let mut store: Vec<Future> = Vec::new();
        store.set_future(future("r1", "svcA", FutureKind::Put, "a"));
        store.set_future(future("r1", "svcA", FutureKind::Put, "b"));
        store.set_future(future("r1", "svcA", FutureKind::Delete, "c"));
        store.set_future(future("r1", "svcB", FutureKind::Put, "d"));

        assert_eq!(store.len(), 3);
        let put = store.get_future("r1", "svcA", &FutureKind::Put).unwrap();
        assert_eq!(put.data, "b");
    }

    #[test]
    fn test_delete_only_removes_matching_key() {
        let mut store = vec![
            future("r1", "svcA", FutureKind::Put, "a"),
            future("r1", "svcA", FutureKind::Delete, "b"),
        ];
        store.delete_future("r1", "svcA", &FutureKind::Put);
        assert!(store.get_future("r1", "svcA", &FutureKind::Put).is_none());
        assert!(store.get_future("r1", "svcA", &FutureKind::Delete).is_some());

        // Deleting an absent key is a no-op.
        store.delete_future("r2", "svcA", &FutureKind::Put);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_futures_for_ignores_kind() {
        let store = vec![
            future("r1", "svcA", FutureKind::Put, "a"),
            future("r1", "svcA", FutureKind::Unknown("PATCH".to_string()), "b"),
            future("r1", "svcB", FutureKind::Put, "c"),
        ];
        let found: Vec<&str> = store
            .futures_for("r1", "svcA")
            .iter()
            .map(|f| f.data.as_str())
            .collect();
        assert_eq!(found, vec!["a", "b"]);
        assert!(store.deadline().is_none());
    }

    #[test]
    fn test_persisted_format() {
        let f = future("r1", "privateendpoints", FutureKind::Delete, "dG9rZW4=");
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["type"], "DELETE");
        assert_eq!(json["serviceName"], "privateendpoints");
        assert_eq!(json["name"], "r1");
        assert_eq!(json["resourceGroup"], "g1");
        assert_eq!(json["data"], "dG9rZW4=");

        let parsed: Future = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, f);
    }

    #[test]
    fn test_unknown_kind_survives_round_trip() {
        let yaml = "type: PATCH\nserviceName: svc\nname: r\nresourceGroup: g\ndata: eA==\n";
        let parsed: Future = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.kind, FutureKind::Unknown("PATCH".to_string()));
        assert!(serde_yaml::to_string(&parsed).unwrap().contains("type: PATCH"));
    }
}
