use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Window assignment for keyed aggregations. Times are record timestamps in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    Tumbling { size: Duration },
    Session { gap: Duration },
}

impl WindowSpec {
    /// Start of the tumbling window holding `timestamp_ms`.
    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        match self {
            WindowSpec::Tumbling { size } => {
                let size_ms = (size.as_millis() as i64).max(1);
                timestamp_ms - timestamp_ms.rem_euclid(size_ms)
            }
            WindowSpec::Session { .. } => timestamp_ms,
        }
    }
}

/// A session for one key: `[start, end]` plus its accumulated value.
#[derive(Debug, Clone, PartialEq)]
pub struct Session<V> {
    pub start: i64,
    pub end: i64,
    pub value: V,
}

/// Outcome of offering a record to the session store.
#[derive(Debug, PartialEq)]
pub enum SessionUpdate {
    Merged { start: i64, end: i64 },
    /// The session the record belongs to is already closed.
    Late { start: i64, end: i64 },
}

/// Open session windows of one partition, with zero grace.
///
/// A session closes once `end + gap < stream_time`. Closed sessions are
/// handed out exactly once by [`SessionStore::drain_closed`].
pub struct SessionStore<V> {
    gap_ms: i64,
    sessions: HashMap<String, Vec<Session<V>>>,
    by_end: BTreeSet<(i64, String, i64)>,
}

impl<V> SessionStore<V> {
    pub fn new(gap: Duration) -> Self {
        Self {
            gap_ms: gap.as_millis() as i64,
            sessions: HashMap::new(),
            by_end: BTreeSet::new(),
        }
    }

    pub fn gap_ms(&self) -> i64 {
        self.gap_ms
    }

    pub fn len(&self) -> usize {
        self.by_end.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_end.is_empty()
    }

    fn bridges(&self, session: &Session<V>, timestamp_ms: i64) -> bool {
        session.start - self.gap_ms <= timestamp_ms && timestamp_ms <= session.end + self.gap_ms
    }

    /// Folds a record at `timestamp_ms` into every session of `key` it
    /// bridges. `merge` joins two session values; `aggregate` adds the record.
    pub fn put(
        &mut self,
        key: &str,
        timestamp_ms: i64,
        stream_time: i64,
        init: impl FnOnce() -> V,
        merge: impl Fn(V, V) -> V,
        aggregate: impl FnOnce(V) -> V,
    ) -> SessionUpdate {
        let existing = self.sessions.remove(key).unwrap_or_default();
        let (bridged, kept): (Vec<_>, Vec<_>) = existing
            .into_iter()
            .partition(|s| self.bridges(s, timestamp_ms));

        let start = bridged.iter().map(|s| s.start).fold(timestamp_ms, i64::min);
        let end = bridged.iter().map(|s| s.end).fold(timestamp_ms, i64::max);

        if end + self.gap_ms < stream_time {
            let mut restored = kept;
            restored.extend(bridged);
            self.sessions.insert(key.to_string(), restored);
            return SessionUpdate::Late { start, end };
        }

        let mut value: Option<V> = None;
        for session in bridged {
            self.by_end.remove(&(session.end, key.to_string(), session.start));
            value = Some(match value {
                None => session.value,
                Some(acc) => merge(acc, session.value),
            });
        }
        let value = aggregate(value.unwrap_or_else(init));

        let mut sessions = kept;
        sessions.push(Session { start, end, value });
        sessions.sort_by_key(|s| s.start);
        self.by_end.insert((end, key.to_string(), start));
        self.sessions.insert(key.to_string(), sessions);
        SessionUpdate::Merged { start, end }
    }

    /// Removes and returns every session closed at `stream_time`, oldest end first.
    pub fn drain_closed(&mut self, stream_time: i64) -> Vec<(String, Session<V>)> {
        let mut closed = Vec::new();
        while let Some((end, key, start)) = self.by_end.first().cloned() {
            if end + self.gap_ms >= stream_time {
                break;
            }
            self.by_end.remove(&(end, key.clone(), start));
            if let Some(sessions) = self.sessions.get_mut(&key) {
                if let Some(pos) = sessions.iter().position(|s| s.start == start && s.end == end) {
                    closed.push((key.clone(), sessions.remove(pos)));
                }
                if sessions.is_empty() {
                    self.sessions.remove(&key);
                }
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(store: &mut SessionStore<Vec<u32>>, key: &str, ts: i64, st: i64, v: u32) -> SessionUpdate {
        store.put(
            key,
            ts,
            st,
            Vec::new,
            |mut a, b| {
                a.extend(b);
                a
            },
            |mut acc| {
                acc.push(v);
                acc
            },
        )
    }

    #[test]
    fn test_records_within_gap_share_a_session() {
        let mut store = SessionStore::new(Duration::from_millis(1000));
        push(&mut store, "a", 0, 0, 1);
        assert_eq!(push(&mut store, "a", 900, 900, 2), SessionUpdate::Merged { start: 0, end: 900 });
        assert_eq!(store.len(), 1);
        assert!(store.drain_closed(1900).is_empty());

        let closed = store.drain_closed(1901);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1.value, vec![1, 2]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_bridging_record_joins_sessions() {
        let mut store = SessionStore::new(Duration::from_millis(100));
        push(&mut store, "a", 0, 0, 1);
        push(&mut store, "a", 150, 150, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(push(&mut store, "a", 80, 150, 3), SessionUpdate::Merged { start: 0, end: 150 });
        assert_eq!(store.len(), 1);
        let closed = store.drain_closed(1000);
        assert_eq!(closed[0].1.value, vec![1, 2, 3]);
    }

    #[test]
    fn test_late_record_is_rejected() {
        let mut store = SessionStore::new(Duration::from_millis(100));
        push(&mut store, "b", 500, 500, 1);
        assert!(matches!(push(&mut store, "a", 0, 500, 1), SessionUpdate::Late { .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_tumbling_window_start() {
        let spec = WindowSpec::Tumbling { size: Duration::from_secs(60) };
        assert_eq!(spec.window_start(125_000), 120_000);
        assert_eq!(spec.window_start(60_000), 60_000);
    }
}
