//! Shared types between the conductor, the aggregation workers and the
//! target-selection service
//!
//! These types are used by:
//! - the Conductor state machine and its persisted query documents
//! - the Data Aggregator worker pool
//! - the HTTP surfaces each role exposes
//!
//! Serializable with serde for JSON over HTTP and in the document store.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, MapAccess, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================================
// Core Types
// ============================================================================

/// Unique identifier for a distributed query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct QueryId(pub String);

impl QueryId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Row Values
// ============================================================================

/// A single cell of a row or of an aggregation result map.
///
/// Untagged on the wire: `5` is `Int`, `5.1` is `Float`, `"a"` is `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Rows and result maps share the same shape.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("cannot convert to number: {0:?}")]
    NotNumeric(String),
    #[error("cannot convert {0} to number")]
    Unsupported(&'static str),
    #[error("expected a list, found {0}")]
    NotAList(&'static str),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Total coercion to a float: text, lists and maps are type mismatches.
    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            Value::Bool(true) => Ok(1.0),
            Value::Bool(false) => Ok(0.0),
            Value::Text(s) => Err(ValueError::NotNumeric(s.clone())),
            Value::List(_) => Err(ValueError::Unsupported("list")),
            Value::Map(_) => Err(ValueError::Unsupported("map")),
        }
    }

    pub fn as_f64_list(&self) -> Result<Vec<f64>, ValueError> {
        match self {
            Value::List(items) => items.iter().map(Value::as_f64).collect(),
            other => Err(ValueError::NotAList(other.kind())),
        }
    }

    /// Row-major square matrix stored as a list of lists.
    pub fn as_f64_matrix(&self) -> Result<Vec<Vec<f64>>, ValueError> {
        match self {
            Value::List(rows) => rows.iter().map(Value::as_f64_list).collect(),
            other => Err(ValueError::NotAList(other.kind())),
        }
    }

    pub fn from_f64_slice(values: &[f64]) -> Self {
        Value::List(values.iter().copied().map(Value::Float).collect())
    }

    pub fn from_f64_matrix(rows: &[Vec<f64>]) -> Self {
        Value::List(rows.iter().map(|row| Value::from_f64_slice(row)).collect())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

// ============================================================================
// Opaque Payloads
// ============================================================================

/// Opaque byte payload passed between stages. Serialized as base64.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Blob)
            .map_err(de::Error::custom)
    }
}

// ============================================================================
// Query Record
// ============================================================================

/// Durable pipeline stages. Serialized with the short names stored in the
/// `checkpoints` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Checkpoint {
    #[serde(rename = "ci")]
    ConceptsResolved,
    #[serde(rename = "fetch")]
    AddressListsFetched,
    #[serde(rename = "tf")]
    TargetsSelected,
    #[serde(rename = "t")]
    LocalQueryCompleted,
    #[serde(rename = "da")]
    AggregationCompleted,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 5] = [
        Checkpoint::ConceptsResolved,
        Checkpoint::AddressListsFetched,
        Checkpoint::TargetsSelected,
        Checkpoint::LocalQueryCompleted,
        Checkpoint::AggregationCompleted,
    ];
}

/// Stage name → completion flag. Flags only ever move from false to true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoints(BTreeMap<Checkpoint, bool>);

impl Checkpoints {
    pub fn new() -> Self {
        Self(Checkpoint::ALL.iter().map(|c| (*c, false)).collect())
    }

    pub fn is_set(&self, checkpoint: Checkpoint) -> bool {
        self.0.get(&checkpoint).copied().unwrap_or(false)
    }

    pub fn mark(&mut self, checkpoint: Checkpoint) {
        self.0.insert(checkpoint, true);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Checkpoint, &bool)> {
        self.0.iter()
    }
}

/// `{function, args}`: interpreted by the aggregator against a fixed registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationJob {
    pub function: String,
    #[serde(default)]
    pub args: Row,
}

impl AggregationJob {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Row::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// One round of the layered aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Number of parallel work units (folds).
    pub size: usize,
    pub jobs: Vec<AggregationJob>,
    /// Literal input rows; only meaningful for layer 0.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    pub checkpoints: Checkpoints,
    pub layers: Vec<Layer>,
    #[serde(rename = "encryptedConcepts")]
    pub encrypted_concepts: Blob,
    #[serde(rename = "encryptedListsOfAddresses", default)]
    pub encrypted_lists_of_addresses: Blob,
    #[serde(rename = "encryptedLocalQuery")]
    pub encrypted_local_query: Blob,
    #[serde(rename = "encryptedTargetProfile")]
    pub encrypted_target_profile: Blob,
    #[serde(rename = "encryptedTargets", default)]
    pub encrypted_targets: Blob,
    #[serde(default)]
    pub results: Option<Row>,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /conductor/queries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySubmission {
    pub concepts: Vec<String>,
    pub target_profile: TargetProfile,
    #[serde(default)]
    pub local_query: serde_json::Value,
    pub layers: Vec<Layer>,
}

/// A concept name paired with its canonical hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConcept {
    pub name: String,
    pub hash: String,
}

/// Subscriber address list for one resolved concept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub concept: String,
    pub addresses: Vec<String>,
}

// ============================================================================
// Async Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    Aggregation,
    QueryTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Waiting,
    Running,
    Finished,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Timing and outcome of one stage or one unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub started_at: Option<DateTime<Utc>>,
    /// When the remote side acknowledged receipt, if it said so.
    pub arrived_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub host: Option<String>,
}

/// One persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncTask {
    pub id: String,
    pub kind: TaskType,
    pub query_id: QueryId,
    pub layer: usize,
    pub unit: usize,
    pub state: TaskState,
    #[serde(default)]
    pub result: Row,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl AsyncTask {
    pub fn aggregation_id(query_id: &QueryId, layer: usize, unit: usize) -> String {
        format!("{query_id}-{layer}-{unit}")
    }

    pub fn query_target_id(query_id: &QueryId) -> String {
        format!("{query_id}-target")
    }
}

/// Per-query observability record: stage name → timing/error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub query_id: QueryId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stages: BTreeMap<String, TaskMetadata>,
}

impl ExecutionMetadata {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            created_at: Utc::now(),
            ended_at: None,
            stages: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Target Profiles
// ============================================================================

const PROFILE_SINGLE: u8 = 0;
const PROFILE_UNION: u8 = 1;
const PROFILE_INTERSECTION: u8 = 2;

/// Boolean expression over named address lists.
///
/// Wire form: `{"type":0,"value":"name"}` for a leaf,
/// `{"type":1|2,"left":{..},"right":{..}}` for union / intersection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetProfile {
    Single(String),
    Union(Box<TargetProfile>, Box<TargetProfile>),
    Intersection(Box<TargetProfile>, Box<TargetProfile>),
}

impl TargetProfile {
    pub fn single(name: impl Into<String>) -> Self {
        TargetProfile::Single(name.into())
    }

    pub fn union(left: TargetProfile, right: TargetProfile) -> Self {
        TargetProfile::Union(Box::new(left), Box::new(right))
    }

    pub fn intersection(left: TargetProfile, right: TargetProfile) -> Self {
        TargetProfile::Intersection(Box::new(left), Box::new(right))
    }

    pub fn tag(&self) -> u8 {
        match self {
            TargetProfile::Single(_) => PROFILE_SINGLE,
            TargetProfile::Union(..) => PROFILE_UNION,
            TargetProfile::Intersection(..) => PROFILE_INTERSECTION,
        }
    }
}

impl Serialize for TargetProfile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TargetProfile::Single(value) => {
                let mut node = serializer.serialize_struct("TargetProfile", 2)?;
                node.serialize_field("type", &PROFILE_SINGLE)?;
                node.serialize_field("value", value)?;
                node.end()
            }
            TargetProfile::Union(left, right) | TargetProfile::Intersection(left, right) => {
                let mut node = serializer.serialize_struct("TargetProfile", 3)?;
                node.serialize_field("type", &self.tag())?;
                node.serialize_field("left", left)?;
                node.serialize_field("right", right)?;
                node.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for TargetProfile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_struct(
            "TargetProfile",
            &["type", "value", "left", "right"],
            TargetProfileVisitor,
        )
    }
}

struct TargetProfileVisitor;

impl<'de> Visitor<'de> for TargetProfileVisitor {
    type Value = TargetProfile;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a target profile node")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<TargetProfile, A::Error> {
        let mut tag: Option<u8> = None;
        let mut value: Option<String> = None;
        let mut left: Option<TargetProfile> = None;
        let mut right: Option<TargetProfile> = None;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "type" => tag = Some(map.next_value()?),
                "value" => value = Some(map.next_value()?),
                "left" => left = Some(map.next_value()?),
                "right" => right = Some(map.next_value()?),
                _ => {
                    map.next_value::<de::IgnoredAny>()?;
                }
            }
        }

        let tag = tag.ok_or_else(|| de::Error::missing_field("type"))?;
        match tag {
            PROFILE_SINGLE => Ok(TargetProfile::Single(
                value.ok_or_else(|| de::Error::missing_field("value"))?,
            )),
            PROFILE_UNION | PROFILE_INTERSECTION => {
                let left = Box::new(left.ok_or_else(|| de::Error::missing_field("left"))?);
                let right = Box::new(right.ok_or_else(|| de::Error::missing_field("right"))?);
                if tag == PROFILE_UNION {
                    Ok(TargetProfile::Union(left, right))
                } else {
                    Ok(TargetProfile::Intersection(left, right))
                }
            }
            other => Err(de::Error::custom(format!(
                "unknown target profile type tag: {other}"
            ))),
        }
    }
}

// ============================================================================
// Wire Payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptLookupRequest {
    pub concepts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptLookupResponse {
    pub hashes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectTargetsRequest {
    pub query_id: QueryId,
    /// JSON map of list name → addresses.
    pub lists: Blob,
    /// JSON-encoded [`TargetProfile`].
    pub profile: Blob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectTargetsResponse {
    pub targets: Blob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalQueryRequest {
    pub query_id: QueryId,
    pub targets: Blob,
    pub local_query: Blob,
}

/// Body of the stage-4 completion callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalQueryResults {
    pub rows: Vec<Row>,
}

/// One unit of aggregation work, as delivered to the aggregator role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub query_id: QueryId,
    pub layer: usize,
    pub unit: usize,
    pub rows: Vec<Row>,
    pub jobs: Vec<AggregationJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeAck {
    pub status: String,
    pub arrived_at: DateTime<Utc>,
}

/// Body of the worker → conductor result callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResultReport {
    pub result: Row,
}

/// Body of the worker → conductor failure callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailureReport {
    pub reason: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn four_leaf_profile() -> TargetProfile {
        TargetProfile::union(
            TargetProfile::intersection(
                TargetProfile::single("test1"),
                TargetProfile::single("test2"),
            ),
            TargetProfile::intersection(
                TargetProfile::single("test3"),
                TargetProfile::single("test4"),
            ),
        )
    }

    #[test]
    fn test_query_id_generation() {
        let id1 = QueryId::new();
        let id2 = QueryId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 26); // ULID length
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(Value::Int(3).as_f64(), Ok(3.0));
        assert_eq!(Value::Float(2.5).as_f64(), Ok(2.5));
        assert_eq!(Value::Bool(true).as_f64(), Ok(1.0));
        assert_eq!(Value::Bool(false).as_f64(), Ok(0.0));
        assert!(matches!(
            Value::Text("7".into()).as_f64(),
            Err(ValueError::NotNumeric(_))
        ));
        assert!(Value::List(vec![]).as_f64().is_err());
    }

    #[test]
    fn test_value_untagged_wire_form() {
        let row: Row = serde_json::from_str(r#"{"x":5,"y":5.1,"ok":true,"name":"a"}"#).unwrap();
        assert_eq!(row["x"], Value::Int(5));
        assert_eq!(row["y"], Value::Float(5.1));
        assert_eq!(row["ok"], Value::Bool(true));
        assert_eq!(row["name"], Value::Text("a".into()));
    }

    #[test]
    fn test_blob_is_base64_on_the_wire() {
        let blob = Blob(b"hello".to_vec());
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, "\"aGVsbG8=\"");
        let back: Blob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn test_checkpoints_use_short_names() {
        let mut checkpoints = Checkpoints::new();
        checkpoints.mark(Checkpoint::ConceptsResolved);
        let json = serde_json::to_value(&checkpoints).unwrap();
        assert_eq!(json["ci"], true);
        assert_eq!(json["fetch"], false);
        assert_eq!(json["da"], false);
        assert!(checkpoints.is_set(Checkpoint::ConceptsResolved));
        assert!(!checkpoints.is_set(Checkpoint::TargetsSelected));
    }

    #[test]
    fn test_target_profile_round_trip_is_byte_identical() {
        let encoded = serde_json::to_string(&four_leaf_profile()).unwrap();
        let decoded: TargetProfile = serde_json::from_str(&encoded).unwrap();
        let reencoded = serde_json::to_string(&decoded).unwrap();

        assert_eq!(encoded, reencoded);
        assert_eq!(decoded, four_leaf_profile());

        let tags: Vec<&str> = encoded
            .match_indices("\"type\":")
            .map(|(i, _)| &encoded[i + 7..i + 8])
            .collect();
        assert_eq!(tags, vec!["1", "2", "0", "0", "2", "0", "0"]);
    }

    #[test]
    fn test_target_profile_leaf_round_trip() {
        let leaf = TargetProfile::single("test1");
        let encoded = serde_json::to_string(&leaf).unwrap();
        assert_eq!(encoded, r#"{"type":0,"value":"test1"}"#);
        let decoded: TargetProfile = serde_json::from_str(&encoded).unwrap();
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn test_target_profile_rejects_unknown_tag() {
        let err = serde_json::from_str::<TargetProfile>(r#"{"type":7,"value":"x"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown target profile type tag"));
    }

    #[test]
    fn test_target_profile_rejects_missing_child() {
        let result =
            serde_json::from_str::<TargetProfile>(r#"{"type":1,"left":{"type":0,"value":"a"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_task_ids_are_deterministic() {
        let id = QueryId::from("q1");
        assert_eq!(AsyncTask::aggregation_id(&id, 2, 3), "q1-2-3");
        assert_eq!(AsyncTask::query_target_id(&id), "q1-target");
    }
}
