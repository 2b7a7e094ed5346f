use std::collections::HashMap;

use serde_json::{json, Map, Value};

/// Per-topic roster of client identities, derived from topic membership.
///
/// One entry exists per client id regardless of how many connections that
/// client holds on the topic; only the 0<->1 connection transitions produce
/// presence diffs, so duplicate connections never duplicate roster entries.
#[derive(Debug, Default)]
pub struct Roster {
    entries: HashMap<String, RosterEntry>,
}

#[derive(Debug)]
struct RosterEntry {
    meta: Value,
    connections: u32,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more connection for `client_id`. Returns true when this
    /// is the client's first connection on the topic, i.e. a join diff is
    /// due. Metadata from the first connection wins.
    pub fn join(&mut self, client_id: &str, meta: Value) -> bool {
        match self.entries.get_mut(client_id) {
            Some(entry) => {
                entry.connections += 1;
                false
            }
            None => {
                self.entries.insert(
                    client_id.to_owned(),
                    RosterEntry {
                        meta,
                        connections: 1,
                    },
                );
                true
            }
        }
    }

    /// Records one connection of `client_id` leaving. Returns the entry
    /// metadata when the last connection left, i.e. a leave diff is due.
    pub fn leave(&mut self, client_id: &str) -> Option<Value> {
        let entry = self.entries.get_mut(client_id)?;
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections > 0 {
            return None;
        }
        self.entries.remove(client_id).map(|entry| entry.meta)
    }

    /// Full-roster payload for `presence_state`: `{client_id: metadata}`.
    pub fn state_payload(&self) -> Value {
        let mut state = Map::new();
        for (client_id, entry) in &self.entries {
            state.insert(client_id.clone(), entry.meta.clone());
        }
        Value::Object(state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn join_diff(client_id: &str, meta: &Value) -> Value {
    json!({
        "joins": { client_id: meta },
        "leaves": {},
    })
}

pub fn leave_diff(client_id: &str, meta: &Value) -> Value {
    json!({
        "joins": {},
        "leaves": { client_id: meta },
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{join_diff, leave_diff, Roster};

    #[test]
    fn first_join_is_diffable_and_lands_in_state() {
        let mut roster = Roster::new();
        assert!(roster.join("c1", json!({ "online_at": 1 })));
        assert_eq!(roster.state_payload(), json!({ "c1": { "online_at": 1 } }));
    }

    #[test]
    fn second_connection_of_same_client_produces_no_diff() {
        let mut roster = Roster::new();
        assert!(roster.join("c1", json!({ "online_at": 1 })));
        assert!(!roster.join("c1", json!({ "online_at": 2 })));
        assert_eq!(roster.len(), 1);
        // first connection's metadata wins
        assert_eq!(roster.state_payload(), json!({ "c1": { "online_at": 1 } }));
    }

    #[test]
    fn leave_diffs_only_when_last_connection_departs() {
        let mut roster = Roster::new();
        roster.join("c1", json!({ "online_at": 1 }));
        roster.join("c1", json!({ "online_at": 2 }));
        assert_eq!(roster.leave("c1"), None);
        assert_eq!(roster.leave("c1"), Some(json!({ "online_at": 1 })));
        assert!(roster.is_empty());
    }

    #[test]
    fn leave_of_unknown_client_is_ignored() {
        let mut roster = Roster::new();
        assert_eq!(roster.leave("ghost"), None);
    }

    #[test]
    fn diff_payloads_have_phoenix_shape() {
        let meta = json!({ "online_at": 7 });
        assert_eq!(
            join_diff("c2", &meta),
            json!({ "joins": { "c2": { "online_at": 7 } }, "leaves": {} })
        );
        assert_eq!(
            leave_diff("c2", &meta),
            json!({ "joins": {}, "leaves": { "c2": { "online_at": 7 } } })
        );
    }
}
