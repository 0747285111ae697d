//! Append-only event journal.
//!
//! The journal is the source of truth for audit and replay: one `created`
//! record per instance, one `transition` record per successful transition,
//! each a single newline-terminated line of canonical JSON.
//!
//! # Layout
//!
//! `<data_dir>/<tenant | "no_tenant">/events/<module-short-name>/<sanitized-fsm-id>/<YYYY>/<MM>/<DD>.jsonl`
//!
//! Files are opened in append mode and each record is written with one
//! `write` call, so a failed append never leaves a partial line.
//!
//! # Sequence numbers
//!
//! `seq` comes from a single process-wide atomic counter, preserving
//! cross-id total ordering within a process. The journal is never rewritten
//! on restart; ordering across restarts relies on the timestamp as
//! tiebreaker, and `list` de-duplicates on `(seq, timestamp)`.
//!
//! # Failure policy
//!
//! Append errors surface to the transition engine, which treats them as
//! non-fatal for the transition (the in-memory state change has already
//! happened) but fatal for durability: the error is logged and reported
//! through telemetry. At most one record is written per transition.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::JournalError;
use crate::instance::{DataMap, FsmInstance};
use crate::kind::FsmKind;
use crate::telemetry::{TelemetryEvent, TelemetryHandle, TOPIC_JOURNAL_APPEND};

/// One durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Appended once when an instance is created.
    Created {
        fsm_id: String,
        tenant_id: Option<String>,
        module: String,
        initial_state: String,
        initial_data: DataMap,
        timestamp: DateTime<Utc>,
        seq: u64,
    },
    /// Appended once per successful transition.
    Transition {
        fsm_id: String,
        tenant_id: Option<String>,
        module: String,
        from: String,
        to: String,
        event: String,
        event_data: DataMap,
        timestamp: DateTime<Utc>,
        seq: u64,
    },
}

impl JournalRecord {
    /// The record's sequence number.
    pub fn seq(&self) -> u64 {
        match self {
            JournalRecord::Created { seq, .. } | JournalRecord::Transition { seq, .. } => *seq,
        }
    }

    /// The record's timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JournalRecord::Created { timestamp, .. }
            | JournalRecord::Transition { timestamp, .. } => *timestamp,
        }
    }

    /// The instance this record belongs to.
    pub fn fsm_id(&self) -> &str {
        match self {
            JournalRecord::Created { fsm_id, .. } | JournalRecord::Transition { fsm_id, .. } => {
                fsm_id
            }
        }
    }

    /// `"created"` or `"transition"`.
    pub fn record_type(&self) -> &'static str {
        match self {
            JournalRecord::Created { .. } => "created",
            JournalRecord::Transition { .. } => "transition",
        }
    }
}

/// Replace each maximal run of characters outside `[A-Za-z0-9_-]` with a
/// single `_`, then trim leading and trailing `_`.
pub fn sanitize_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    let mut in_run = false;
    for c in id.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Path component for an optional tenant.
pub fn tenant_segment(tenant_id: Option<&str>) -> &str {
    tenant_id.unwrap_or("no_tenant")
}

/// The append-only, partitioned event journal.
pub struct EventJournal {
    root: PathBuf,
    seq: AtomicU64,
    /// Records appended in this process lifetime, keyed by fsm id.
    cache: DashMap<String, Vec<JournalRecord>>,
    /// Per-file append serialization.
    file_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    telemetry: TelemetryHandle,
}

impl EventJournal {
    /// Create a journal rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, telemetry: TelemetryHandle) -> Self {
        Self {
            root: root.into(),
            seq: AtomicU64::new(0),
            cache: DashMap::new(),
            file_locks: DashMap::new(),
            telemetry,
        }
    }

    /// The next sequence number.
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Append the creation record for a fresh instance.
    pub fn append_created(
        &self,
        kind: &FsmKind,
        instance: &FsmInstance,
        initial_data: &DataMap,
    ) -> Result<u64, JournalError> {
        let record = JournalRecord::Created {
            fsm_id: instance.id.clone(),
            tenant_id: instance.tenant_id.clone(),
            module: kind.name().to_string(),
            initial_state: instance.current_state.clone(),
            initial_data: initial_data.clone(),
            timestamp: Utc::now(),
            seq: self.next_seq(),
        };
        self.append(kind, instance, record)
    }

    /// Append the record for one completed transition.
    pub fn append_transition(
        &self,
        kind: &FsmKind,
        instance: &FsmInstance,
        from: &str,
        event: &str,
        event_data: &DataMap,
    ) -> Result<u64, JournalError> {
        let record = JournalRecord::Transition {
            fsm_id: instance.id.clone(),
            tenant_id: instance.tenant_id.clone(),
            module: kind.name().to_string(),
            from: from.to_string(),
            to: instance.current_state.clone(),
            event: event.to_string(),
            event_data: event_data.clone(),
            timestamp: Utc::now(),
            seq: self.next_seq(),
        };
        self.append(kind, instance, record)
    }

    fn append(
        &self,
        kind: &FsmKind,
        instance: &FsmInstance,
        record: JournalRecord,
    ) -> Result<u64, JournalError> {
        let started = Instant::now();
        let seq = record.seq();
        let path = self.partition_path(
            instance.tenant_id.as_deref(),
            kind.short_name(),
            &instance.id,
            record.timestamp(),
        );

        let result = self.write_line(&path, &record);

        let mut event = TelemetryEvent::new(TOPIC_JOURNAL_APPEND)
            .field("duration_us", started.elapsed().as_micros() as u64)
            .field("path", path.to_string_lossy().to_string())
            .field("fsm_id", instance.id.as_str())
            .field("kind", kind.name())
            .field("type", record.record_type());
        if let Err(ref e) = result {
            event = event.field("error", e.to_string());
        }
        self.telemetry.emit(event);

        result?;
        self.cache
            .entry(instance.id.clone())
            .or_default()
            .push(record);
        Ok(seq)
    }

    fn write_line(&self, path: &Path, record: &JournalRecord) -> Result<(), JournalError> {
        let line = serde_json::to_string(record).map_err(|e| JournalError::AppendFailed {
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| JournalError::AppendFailed {
                reason: e.to_string(),
            })?;
        }

        let lock = self
            .file_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| JournalError::AppendFailed {
                reason: e.to_string(),
            })?;
        // One buffered write of the full line keeps the append atomic at
        // the line level.
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf).map_err(|e| JournalError::AppendFailed {
            reason: e.to_string(),
        })
    }

    /// All records for an instance, merged from disk and the in-process
    /// cache, de-duplicated on `(seq, timestamp)`, ascending.
    pub fn list(&self, fsm_id: &str) -> Result<Vec<JournalRecord>, JournalError> {
        let mut records = self.read_from_disk(fsm_id)?;
        if let Some(cached) = self.cache.get(fsm_id) {
            records.extend(cached.iter().cloned());
        }
        records.sort_by_key(|r| (r.seq(), r.timestamp()));
        records.dedup_by_key(|r| (r.seq(), r.timestamp()));
        Ok(records)
    }

    fn read_from_disk(&self, fsm_id: &str) -> Result<Vec<JournalRecord>, JournalError> {
        let sanitized = sanitize_id(fsm_id);
        let mut records = Vec::new();
        let tenants = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(records),
        };
        for tenant in tenants.flatten() {
            let events_dir = tenant.path().join("events");
            let modules = match fs::read_dir(&events_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for module in modules.flatten() {
                let id_dir = module.path().join(&sanitized);
                if id_dir.is_dir() {
                    read_jsonl_tree(&id_dir, fsm_id, &mut records)?;
                }
            }
        }
        Ok(records)
    }

    /// Partition path for one record.
    fn partition_path(
        &self,
        tenant_id: Option<&str>,
        module_short: &str,
        fsm_id: &str,
        timestamp: DateTime<Utc>,
    ) -> PathBuf {
        self.root
            .join(tenant_segment(tenant_id))
            .join("events")
            .join(module_short)
            .join(sanitize_id(fsm_id))
            .join(format!("{}", timestamp.format("%Y")))
            .join(format!("{}", timestamp.format("%m")))
            .join(format!("{}.jsonl", timestamp.format("%d")))
    }
}

/// Recursively read every `.jsonl` file under `dir`, keeping records whose
/// `fsm_id` matches (sanitized directory names can collide).
fn read_jsonl_tree(
    dir: &Path,
    fsm_id: &str,
    out: &mut Vec<JournalRecord>,
) -> Result<(), JournalError> {
    let entries = fs::read_dir(dir).map_err(|e| JournalError::ReadFailed {
        reason: e.to_string(),
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            read_jsonl_tree(&path, fsm_id, out)?;
        } else if path.extension().is_some_and(|ext| ext == "jsonl") {
            let content = fs::read_to_string(&path).map_err(|e| JournalError::ReadFailed {
                reason: e.to_string(),
            })?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<JournalRecord>(line) {
                    Ok(record) if record.fsm_id() == fsm_id => out.push(record),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping malformed journal line");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Reference interpreter: fold an instance's records into its final state.
///
/// Walks `created` and `transition` records in list order with no hooks and
/// no plugins; this is the oracle the transition engine must agree with.
pub fn replay_state(records: &[JournalRecord]) -> Option<String> {
    let mut state = None;
    for record in records {
        match record {
            JournalRecord::Created { initial_state, .. } => {
                state = Some(initial_state.clone());
            }
            JournalRecord::Transition { to, .. } => {
                state = Some(to.clone());
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{RecordingSink, TOPIC_JOURNAL_APPEND};
    use serde_json::json;
    use std::sync::Arc;

    fn door() -> Arc<FsmKind> {
        FsmKind::builder("Demo.Door")
            .states(["closed", "open"])
            .initial("closed")
            .transition("closed", "open_cmd", "open")
            .transition("open", "close_cmd", "closed")
            .build()
            .unwrap()
    }

    fn journal(dir: &Path) -> (EventJournal, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (EventJournal::new(dir, sink.clone()), sink)
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("door-1a2b"), "door-1a2b");
        assert_eq!(sanitize_id("a b!c"), "a_b_c");
        assert_eq!(sanitize_id("!!door!!"), "door");
        assert_eq!(sanitize_id("x@@@y"), "x_y");
    }

    #[test]
    fn test_append_and_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = journal(dir.path());
        let kind = door();
        let mut instance = FsmInstance::new(&kind, DataMap::new(), None, Some("t1".into()));

        journal
            .append_created(&kind, &instance, &DataMap::new())
            .unwrap();
        let from = instance.current_state.clone();
        instance.current_state = "open".into();
        let mut event_data = DataMap::new();
        event_data.insert("user".into(), json!("u"));
        journal
            .append_transition(&kind, &instance, &from, "open_cmd", &event_data)
            .unwrap();

        let records = journal.list(&instance.id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type(), "created");
        match &records[1] {
            JournalRecord::Transition {
                from, to, event, event_data, ..
            } => {
                assert_eq!(from, "closed");
                assert_eq!(to, "open");
                assert_eq!(event, "open_cmd");
                assert_eq!(event_data.get("user"), Some(&json!("u")));
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn test_seq_is_strictly_increasing_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = journal(dir.path());
        let kind = door();
        let a = FsmInstance::new(&kind, DataMap::new(), None, None);
        let b = FsmInstance::new(&kind, DataMap::new(), None, None);

        let s1 = journal.append_created(&kind, &a, &DataMap::new()).unwrap();
        let s2 = journal.append_created(&kind, &b, &DataMap::new()).unwrap();
        let s3 = journal
            .append_transition(&kind, &a, "closed", "open_cmd", &DataMap::new())
            .unwrap();

        assert!(s1 < s2 && s2 < s3);
    }

    #[test]
    fn test_list_is_seq_ordered_with_no_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = journal(dir.path());
        let kind = door();
        let instance = FsmInstance::new(&kind, DataMap::new(), None, Some("t1".into()));

        journal
            .append_created(&kind, &instance, &DataMap::new())
            .unwrap();
        for _ in 0..5 {
            journal
                .append_transition(&kind, &instance, "closed", "open_cmd", &DataMap::new())
                .unwrap();
        }

        let records = journal.list(&instance.id).unwrap();
        assert_eq!(records.len(), 6);
        for pair in records.windows(2) {
            assert!(pair[0].seq() < pair[1].seq());
        }
    }

    #[test]
    fn test_partition_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = journal(dir.path());
        let kind = door();
        let instance = FsmInstance::new(
            &kind,
            DataMap::new(),
            Some("door a!".into()),
            Some("t1".into()),
        );
        journal
            .append_created(&kind, &instance, &DataMap::new())
            .unwrap();

        let now = Utc::now();
        let expected = dir
            .path()
            .join("t1")
            .join("events")
            .join("Door")
            .join("door_a")
            .join(format!("{}", now.format("%Y")))
            .join(format!("{}", now.format("%m")))
            .join(format!("{}.jsonl", now.format("%d")));
        assert!(expected.is_file(), "missing {expected:?}");
    }

    #[test]
    fn test_no_tenant_partition() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = journal(dir.path());
        let kind = door();
        let instance = FsmInstance::new(&kind, DataMap::new(), None, None);
        journal
            .append_created(&kind, &instance, &DataMap::new())
            .unwrap();

        assert!(dir.path().join("no_tenant").join("events").is_dir());
        assert_eq!(journal.list(&instance.id).unwrap().len(), 1);
    }

    #[test]
    fn test_telemetry_emitted_per_append() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, sink) = journal(dir.path());
        let kind = door();
        let instance = FsmInstance::new(&kind, DataMap::new(), None, None);
        journal
            .append_created(&kind, &instance, &DataMap::new())
            .unwrap();
        journal
            .append_transition(&kind, &instance, "closed", "open_cmd", &DataMap::new())
            .unwrap();

        assert_eq!(sink.count(TOPIC_JOURNAL_APPEND), 2);
        let events = sink.by_topic(TOPIC_JOURNAL_APPEND);
        assert!(events[0].fields.contains_key("duration_us"));
        assert!(events[0].fields.contains_key("path"));
    }

    #[test]
    fn test_records_survive_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let kind = door();
        let instance = FsmInstance::new(&kind, DataMap::new(), None, Some("t1".into()));
        {
            let (journal, _) = journal(dir.path());
            journal
                .append_created(&kind, &instance, &DataMap::new())
                .unwrap();
            journal
                .append_transition(&kind, &instance, "closed", "open_cmd", &DataMap::new())
                .unwrap();
        }
        // Fresh journal, empty cache: reads come from disk.
        let (journal, _) = journal(dir.path());
        let records = journal.list(&instance.id).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_replay_state_folds_records() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = journal(dir.path());
        let kind = door();
        let mut instance = FsmInstance::new(&kind, DataMap::new(), None, None);

        journal
            .append_created(&kind, &instance, &DataMap::new())
            .unwrap();
        instance.current_state = "open".into();
        journal
            .append_transition(&kind, &instance, "closed", "open_cmd", &DataMap::new())
            .unwrap();
        instance.current_state = "closed".into();
        journal
            .append_transition(&kind, &instance, "open", "close_cmd", &DataMap::new())
            .unwrap();

        let records = journal.list(&instance.id).unwrap();
        assert_eq!(replay_state(&records).as_deref(), Some("closed"));
        assert_eq!(replay_state(&[]), None);
    }
}
