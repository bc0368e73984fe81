//! Namespace identification and benign-skew classification.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A fully qualified collection namespace (`db.collection`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Create a namespace from database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse a `db.collection` string. The collection part may itself
    /// contain dots (`config.system.preimages`).
    pub fn parse(s: &str) -> Option<Self> {
        let (db, coll) = s.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Namespace::new(db, coll))
    }

    /// Database name.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Collection name.
    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// Change-stream pre-images bookkeeping collection.
    pub fn is_change_stream_preimages(&self) -> bool {
        self.db == "config" && self.coll == "system.preimages"
    }

    /// Retryable-write image bookkeeping collection. A write to it can be
    /// skipped during steady-state replication, so skew here is expected.
    pub fn is_config_images(&self) -> bool {
        self.db == "config" && self.coll == "image_collection"
    }

    /// Serverless change collection.
    pub fn is_change_collection(&self) -> bool {
        self.db == "config" && self.coll == "system.change_collection"
    }

    /// Whether digest mismatches on this namespace are downgraded from
    /// Error to Warning. These collections are truncated or written
    /// independently per node, so skew between replicas is benign.
    pub fn tolerates_benign_skew(&self) -> bool {
        self.is_change_stream_preimages() || self.is_config_images() || self.is_change_collection()
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Namespace::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid namespace: {s}")))
    }
}
