//! Row-level change events for presentation-layer subscribers.
//!
//! Gateway writes publish one [`ChangeEvent`] per changed row. Consumers that
//! keep a rendered collection merge events into it with [`apply_change`], a
//! single reducer shared by every entity type.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub op: ChangeOp,
    pub id: String,
    /// Full row for insert/update, absent for delete.
    pub record: Option<Value>,
}

impl ChangeEvent {
    pub fn upsert<T: Entity>(op: ChangeOp, row: &T) -> anyhow::Result<Self> {
        Ok(Self {
            table: T::TABLE.to_string(),
            op,
            id: row.entity_id(),
            record: Some(serde_json::to_value(row)?),
        })
    }

    pub fn delete<T: Entity>(row: &T) -> Self {
        Self {
            table: T::TABLE.to_string(),
            op: ChangeOp::Delete,
            id: row.entity_id(),
            record: None,
        }
    }
}

/// A row type that can live in a cached collection.
pub trait Entity: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    fn entity_id(&self) -> String;
}

/// Merges one event into `items`. Returns whether the collection changed.
///
/// Events for other tables are ignored. Inserts of an already-present id and
/// updates of a missing id both become upserts, so replayed or reordered
/// deliveries converge on the same state.
pub fn apply_change<T: Entity>(items: &mut Vec<T>, event: &ChangeEvent) -> anyhow::Result<bool> {
    if event.table != T::TABLE {
        return Ok(false);
    }
    let position = items.iter().position(|item| item.entity_id() == event.id);
    match event.op {
        ChangeOp::Insert | ChangeOp::Update => {
            let record = event
                .record
                .clone()
                .ok_or_else(|| anyhow::anyhow!("{:?} event without record", event.op))?;
            let row: T = serde_json::from_value(record)?;
            match position {
                Some(i) => items[i] = row,
                None => items.push(row),
            }
            Ok(true)
        }
        ChangeOp::Delete => match position {
            Some(i) => {
                items.remove(i);
                Ok(true)
            }
            None => Ok(false),
        },
    }
}

/// In-process fan-out of [`ChangeEvent`]s.
///
/// The binary serves no subscriber route; the feed is a library seam for an
/// embedding presentation layer, which calls [`ChangeFeed::subscribe`] on
/// `AppState::feed`. Without subscribers every publish is dropped.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // no subscribers is fine
        if self.tx.send(event).is_err() {
            debug!("change event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row {
        id: u32,
        label: String,
    }

    impl Entity for Row {
        const TABLE: &'static str = "rows";
        fn entity_id(&self) -> String {
            self.id.to_string()
        }
    }

    fn row(id: u32, label: &str) -> Row {
        Row {
            id,
            label: label.into(),
        }
    }

    #[test]
    fn insert_update_delete() {
        let mut items = vec![row(1, "a")];

        let ev = ChangeEvent::upsert(ChangeOp::Insert, &row(2, "b")).unwrap();
        assert!(apply_change(&mut items, &ev).unwrap());
        assert_eq!(items, vec![row(1, "a"), row(2, "b")]);

        let ev = ChangeEvent::upsert(ChangeOp::Update, &row(1, "a2")).unwrap();
        assert!(apply_change(&mut items, &ev).unwrap());
        assert_eq!(items[0], row(1, "a2"));

        let ev = ChangeEvent::delete(&row(2, "b"));
        assert!(apply_change(&mut items, &ev).unwrap());
        assert_eq!(items, vec![row(1, "a2")]);
    }

    #[test]
    fn replayed_insert_does_not_duplicate() {
        let mut items: Vec<Row> = vec![];
        let ev = ChangeEvent::upsert(ChangeOp::Insert, &row(7, "x")).unwrap();
        apply_change(&mut items, &ev).unwrap();
        apply_change(&mut items, &ev).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn other_tables_and_missing_deletes_are_ignored() {
        let mut items = vec![row(1, "a")];
        let mut ev = ChangeEvent::delete(&row(1, "a"));
        ev.table = "favorites".into();
        assert!(!apply_change(&mut items, &ev).unwrap());

        let ev = ChangeEvent::delete(&row(9, "z"));
        assert!(!apply_change(&mut items, &ev).unwrap());
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn update_without_record_is_an_error() {
        let mut items = vec![row(1, "a")];
        let ev = ChangeEvent {
            table: "rows".into(),
            op: ChangeOp::Update,
            id: "1".into(),
            record: None,
        };
        assert!(apply_change(&mut items, &ev).is_err());
    }

    #[tokio::test]
    async fn feed_delivers_to_subscribers() {
        let feed = ChangeFeed::new(4);
        let mut rx = feed.subscribe();
        feed.publish(ChangeEvent::delete(&row(3, "c")));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.id, "3");
        assert_eq!(got.op, ChangeOp::Delete);
    }
}
