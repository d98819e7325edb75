//! OTChannel (spec §4.7, component C7)
//!
//! ShareDB-style realtime channel: per-`(collection, docId)` total-ordered
//! broadcast with version-checked submission and at-least-once delivery —
//! generalized from `db/events.rs`'s `DomainEvent`/`tokio::sync::broadcast`
//! pattern to a per-document sender kept in a registry instead of one
//! global bus, since distinct documents must not block or reorder each
//! other (spec §4.7 invariant i).

use crate::services::error::EngineError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 256;

/// One ShareDB-style JSON op: `path` always starts `"data"` for record cells
/// (spec §4.7/§6); `oi` ("insert") carries the new value, `od` ("delete")
/// the value it replaced. A pure insert/full-replace carries only `oi`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Op {
    pub p: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub od: Option<Value>,
}

impl Op {
    pub fn data_field(field_id: &str, oi: Value) -> Self {
        Self { p: vec![Value::String("data".into()), Value::String(field_id.to_string())], oi: Some(oi), od: None }
    }
}

/// A bundle of ops applied atomically against one `(collection, docId)`
/// document (spec §4.7 "Multiple operations may be bundled atomically").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtOp {
    pub collection: String,
    pub doc_id: String,
    pub version: i64,
    pub ops: Vec<Op>,
}

impl OtOp {
    pub fn field_changed(field: &crate::models::Field) -> Self {
        Self {
            collection: format!("fld_{}", field.table_id),
            doc_id: field.id.clone(),
            version: field.order,
            ops: vec![Op { p: vec![], oi: serde_json::to_value(field).ok(), od: None }],
        }
    }

    /// One `data.<fieldId>` op per entry in `changed` — the fields actually
    /// touched by the write, not every field on the record (spec §8
    /// scenario 3: a title-propagation update emits exactly one op for the
    /// Link field whose cached title changed).
    pub fn record_changed(record: &crate::models::Record, changed: &HashMap<String, Value>) -> Self {
        let ops = changed.iter().map(|(field_id, value)| Op::data_field(field_id, value.clone())).collect();
        Self {
            collection: format!("rec_{}", record.table_id),
            doc_id: record.id.clone(),
            version: record.version,
            ops,
        }
    }
}

struct DocChannel {
    sender: broadcast::Sender<OtOp>,
    version: i64,
}

/// Keyed by `"{collection}:{docId}"`.
#[derive(Default)]
pub struct OtChannel {
    docs: RwLock<HashMap<String, DocChannel>>,
}

fn key(collection: &str, doc_id: &str) -> String {
    format!("{collection}:{doc_id}")
}

impl OtChannel {
    pub fn new() -> Self {
        Self { docs: RwLock::new(HashMap::new()) }
    }

    async fn sender_for(&self, collection: &str, doc_id: &str) -> broadcast::Sender<OtOp> {
        let k = key(collection, doc_id);
        if let Some(chan) = self.docs.read().await.get(&k) {
            return chan.sender.clone();
        }
        let mut docs = self.docs.write().await;
        docs.entry(k)
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
                DocChannel { sender, version: 0 }
            })
            .sender
            .clone()
    }

    /// Publishes without a version check — used for sibling broadcasts
    /// (schema changes, title propagation) that are not part of the
    /// document's own op history (spec §4.7 "schema-change notifications
    /// ride the same channel but skip `submit_op`'s version gate").
    #[tracing::instrument(skip(self, op))]
    pub async fn publish(&self, collection: &str, doc_id: &str, op: OtOp) -> Result<(), EngineError> {
        let sender = self.sender_for(collection, doc_id).await;
        // A publish with no subscribers is not an error (spec §4.7 "fire
        // silently when no one is listening").
        let _ = sender.send(op);
        Ok(())
    }

    /// Submits an op against the document's current version; rejects with
    /// `VersionConflict` if `op.version` doesn't match (spec §4.7 invariant
    /// ii, the same optimistic-concurrency contract as RecordStore).
    #[tracing::instrument(skip(self, op))]
    pub async fn submit_op(&self, collection: &str, doc_id: &str, op: OtOp) -> Result<i64, EngineError> {
        let k = key(collection, doc_id);
        let mut docs = self.docs.write().await;
        let chan = docs.entry(k).or_insert_with(|| {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            DocChannel { sender, version: 0 }
        });
        if op.version != chan.version + 1 {
            return Err(EngineError::VersionConflict { current: chan.version });
        }
        chan.version = op.version;
        let _ = chan.sender.send(op);
        Ok(chan.version)
    }

    /// Subscribes to a document's op stream. At-least-once delivery: a slow
    /// subscriber that falls behind the broadcast ring buffer resumes at the
    /// oldest op still retained rather than erroring out (spec §4.7
    /// invariant iii), by filtering `Lagged` out of the stream.
    pub async fn subscribe(&self, collection: &str, doc_id: &str) -> impl futures::Stream<Item = OtOp> {
        let sender = self.sender_for(collection, doc_id).await;
        BroadcastStream::new(sender.subscribe()).filter_map(|r| async move { r.ok() })
    }

    pub async fn current_version(&self, collection: &str, doc_id: &str) -> i64 {
        let k = key(collection, doc_id);
        self.docs.read().await.get(&k).map(|c| c.version).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_ops_in_order() {
        let channel = OtChannel::new();
        let mut stream = Box::pin(channel.subscribe("rec_t1", "doc_1").await);

        let op1 = OtOp { collection: "rec_t1".into(), doc_id: "doc_1".into(), version: 1, ops: vec![] };
        let op2 = OtOp { collection: "rec_t1".into(), doc_id: "doc_1".into(), version: 2, ops: vec![] };
        channel.submit_op("rec_t1", "doc_1", op1).await.unwrap();
        channel.submit_op("rec_t1", "doc_1", op2).await.unwrap();

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn submitting_a_stale_version_is_a_conflict() {
        let channel = OtChannel::new();
        let op1 = OtOp { collection: "rec_t1".into(), doc_id: "doc_1".into(), version: 1, ops: vec![] };
        channel.submit_op("rec_t1", "doc_1", op1).await.unwrap();

        let stale = OtOp { collection: "rec_t1".into(), doc_id: "doc_1".into(), version: 1, ops: vec![] };
        let err = channel.submit_op("rec_t1", "doc_1", stale).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict { current: 1 }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let channel = OtChannel::new();
        let op = OtOp { collection: "fld_t1".into(), doc_id: "f1".into(), version: 0, ops: vec![] };
        channel.publish("fld_t1", "f1", op).await.unwrap();
    }

    #[test]
    fn record_changed_emits_a_data_path_op_per_changed_field() {
        use crate::models::Record;
        use serde_json::json;

        let link_field_id = "fld_employer".to_string();
        let mut data = HashMap::new();
        data.insert(link_field_id.clone(), json!({"id": "rec_company_1", "title": "Acme"}));
        let record = Record::new("tbl_people", data, "u1");

        let mut changed = HashMap::new();
        changed.insert(link_field_id.clone(), json!({"id": "rec_company_1", "title": "Acme"}));
        let op = OtOp::record_changed(&record, &changed);

        assert_eq!(op.collection, "rec_tbl_people");
        assert_eq!(op.ops.len(), 1);
        let cell_op = &op.ops[0];
        assert_eq!(cell_op.p, vec![Value::String("data".into()), Value::String(link_field_id.clone())]);
        assert_eq!(cell_op.oi, Some(json!({"id": "rec_company_1", "title": "Acme"})));
        assert_eq!(cell_op.od, None);
    }

    #[tokio::test]
    async fn distinct_documents_do_not_interfere() {
        let channel = OtChannel::new();
        let mut a = Box::pin(channel.subscribe("rec_t1", "doc_a").await);
        let mut b = Box::pin(channel.subscribe("rec_t1", "doc_b").await);

        channel
            .submit_op("rec_t1", "doc_a", OtOp { collection: "rec_t1".into(), doc_id: "doc_a".into(), version: 1, ops: vec![] })
            .await
            .unwrap();

        let got = a.next().await.unwrap();
        assert_eq!(got.doc_id, "doc_a");
        assert_eq!(channel.current_version("rec_t1", "doc_b").await, 0);
        drop(b.next());
    }
}
