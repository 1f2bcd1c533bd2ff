//! Change history: turns raw watch deltas into semantic change records with
//! field-level diffs, keeps them in a bounded ring, and optionally appends
//! each record to a JSON-lines log.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use vantage_core::{health, meta, ChangeOp, ChangeRecord, FieldDiff};

mod diff;

pub use diff::diff_objects;

/// Name suffixes that mark heartbeat-style config maps as routine.
const ROUTINE_CONFIGMAP_SUFFIXES: &[&str] = &["-leader-election", "-lock", "-leader"];

/// Kinds whose every mutation is reconciliation noise.
const ROUTINE_KINDS: &[&str] = &["Lease", "Endpoints", "EndpointSlice"];

/// Changes that are bookkeeping rather than operator-relevant: lease
/// renewals, leader-election config maps, endpoint reconciliation. Filtered
/// from queries by default.
pub fn is_routine(kind: &str, name: &str) -> bool {
    if ROUTINE_KINDS.contains(&kind) {
        return true;
    }
    kind == "ConfigMap"
        && ROUTINE_CONFIGMAP_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Exclusive lower bound on record id (for `?since=` replay).
    pub since: Option<u64>,
    /// Inclusive upper bound on record id.
    pub until: Option<u64>,
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub include_routine: bool,
    pub include_raw_events: bool,
    pub limit: Option<usize>,
}

pub struct ChangeHistory {
    buf: Mutex<VecDeque<ChangeRecord>>,
    capacity: usize,
    next_id: AtomicU64,
    log: Option<Mutex<std::fs::File>>,
}

impl ChangeHistory {
    /// `persist_path`: append-only JSONL file, created lazily. The file is
    /// never truncated or rewritten; rotation is left to the operator.
    pub fn new(capacity: usize, persist_path: Option<PathBuf>) -> Result<Self> {
        let log = match persist_path {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("creating {}", dir.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("opening change log at {}", path.display()))?;
                info!(path = %path.display(), "change history persistence enabled");
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            log,
        })
    }

    /// Ingest one delta. Returns the produced record so the caller can fan
    /// it out; `None` when the delta carries no observable object.
    pub fn record(
        &self,
        kind: &str,
        op: ChangeOp,
        before: Option<&Value>,
        after: Option<&Value>,
    ) -> Option<ChangeRecord> {
        let subject = after.or(before)?;
        let name = meta::name(subject);
        if name.is_empty() {
            return None;
        }

        let diff = match (op, before, after) {
            (ChangeOp::Update, Some(b), Some(a)) => {
                let d = diff::diff_objects(b, a);
                if d.is_empty() {
                    None
                } else {
                    Some(d)
                }
            }
            _ => None,
        };

        let record = ChangeRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: chrono::Utc::now(),
            op,
            kind: kind.to_string(),
            namespace: meta::namespace(subject).map(|s| s.to_string()),
            name: name.to_string(),
            owner: meta::controller_owner(subject),
            health: Some(health::evaluate(kind, subject)),
            summary: summarize(kind, op, subject, diff.as_deref()),
            diff,
            resource_version: meta::resource_version(subject).to_string(),
        };

        {
            let mut buf = self.buf.lock().unwrap();
            if buf.len() >= self.capacity {
                buf.pop_front();
            }
            buf.push_back(record.clone());
        }
        metrics::counter!("history_records_total", 1u64);

        if let Some(log) = &self.log {
            if let Ok(line) = serde_json::to_string(&record) {
                let mut file = log.lock().unwrap();
                if let Err(e) = writeln!(file, "{}", line) {
                    warn!(error = %e, "failed to append change log line");
                }
            }
        }
        Some(record)
    }

    pub fn query(&self, q: &HistoryQuery) -> Vec<ChangeRecord> {
        let limit = q.limit.unwrap_or(100);
        let buf = self.buf.lock().unwrap();
        let mut out: Vec<ChangeRecord> = buf
            .iter()
            .rev()
            .filter(|r| q.since.map(|s| r.id > s).unwrap_or(true))
            .filter(|r| q.until.map(|u| r.id <= u).unwrap_or(true))
            .filter(|r| {
                q.namespace
                    .as_deref()
                    .map(|ns| r.namespace.as_deref() == Some(ns))
                    .unwrap_or(true)
            })
            .filter(|r| q.kind.as_deref().map(|k| r.kind == k).unwrap_or(true))
            .filter(|r| q.include_raw_events || r.kind != "Event")
            .filter(|r| q.include_routine || !is_routine(&r.kind, &r.name))
            .take(limit)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out
    }

    /// Highest id assigned so far (0 before the first record).
    pub fn latest_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Short human summary: replica-bearing kinds quote ready/desired, pods
/// their phase, everything else the first changed field.
fn summarize(kind: &str, op: ChangeOp, subject: &Value, diff: Option<&[FieldDiff]>) -> String {
    let core = if health::replica_bearing(kind) {
        health::ready_desired(kind, subject).map(|(ready, desired)| format!("{}/{} ready", ready, desired))
    } else if kind == "Pod" {
        vantage_core::nested::str_field(subject, &["status", "phase"]).map(|p| p.to_string())
    } else {
        diff.and_then(|d| d.first())
            .map(|d| format!("{} changed", d.path))
    };
    match (op, core) {
        (ChangeOp::Add, Some(core)) => format!("added ({})", core),
        (ChangeOp::Add, None) => "added".to_string(),
        (ChangeOp::Update, Some(core)) => core,
        (ChangeOp::Update, None) => "updated".to_string(),
        (ChangeOp::Delete, _) => "deleted".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(ready: i64, rv: &str) -> Value {
        json!({
            "metadata": {"name": "web", "namespace": "app", "resourceVersion": rv},
            "spec": {"replicas": 3},
            "status": {"readyReplicas": ready, "updatedReplicas": 3},
        })
    }

    #[test]
    fn update_produces_diff_health_and_summary() {
        let h = ChangeHistory::new(100, None).unwrap();
        let before = deployment(3, "10");
        let after = deployment(1, "11");
        let rec = h
            .record("Deployment", ChangeOp::Update, Some(&before), Some(&after))
            .unwrap();
        assert_eq!(rec.op, ChangeOp::Update);
        assert_eq!(rec.summary, "1/3 ready");
        assert_eq!(rec.health, Some(vantage_core::HealthState::Degraded));
        assert_eq!(rec.resource_version, "11");
        let diff = rec.diff.unwrap();
        let entry = diff
            .iter()
            .find(|d| d.path == "status.readyReplicas")
            .expect("readyReplicas diff present");
        assert_eq!(entry.before, json!(3));
        assert_eq!(entry.after, json!(1));
    }

    #[test]
    fn pod_summary_quotes_phase() {
        let h = ChangeHistory::new(100, None).unwrap();
        let pod = json!({
            "metadata": {"name": "p", "namespace": "a", "resourceVersion": "1"},
            "status": {"phase": "Pending"},
        });
        let rec = h.record("Pod", ChangeOp::Add, None, Some(&pod)).unwrap();
        assert_eq!(rec.summary, "added (Pending)");
    }

    #[test]
    fn ids_are_monotone_and_buffer_is_bounded() {
        let h = ChangeHistory::new(3, None).unwrap();
        for i in 0..5 {
            let obj = json!({"metadata": {"name": format!("cm-{}", i), "resourceVersion": "1"}});
            h.record("ConfigMap", ChangeOp::Add, None, Some(&obj));
        }
        assert_eq!(h.len(), 3);
        let records = h.query(&HistoryQuery {
            include_routine: true,
            limit: Some(10),
            ..Default::default()
        });
        assert_eq!(records.len(), 3);
        assert!(records.windows(2).all(|w| w[0].id > w[1].id));
        assert_eq!(records[0].id, 5);
    }

    #[test]
    fn routine_changes_filtered_by_default() {
        let h = ChangeHistory::new(100, None).unwrap();
        let lease = json!({"metadata": {"name": "node-hb", "namespace": "kube-system", "resourceVersion": "1"}});
        let cm = json!({"metadata": {"name": "ctrl-leader-election", "namespace": "kube-system", "resourceVersion": "1"}});
        let pod = json!({"metadata": {"name": "p", "namespace": "kube-system", "resourceVersion": "1"}, "status": {"phase": "Running"}});
        h.record("Lease", ChangeOp::Update, Some(&lease), Some(&lease));
        h.record("ConfigMap", ChangeOp::Update, Some(&cm), Some(&cm));
        h.record("Pod", ChangeOp::Add, None, Some(&pod));

        let visible = h.query(&HistoryQuery::default());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].kind, "Pod");

        let all = h.query(&HistoryQuery {
            include_routine: true,
            ..Default::default()
        });
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn raw_events_need_opt_in() {
        let h = ChangeHistory::new(100, None).unwrap();
        let ev = json!({"metadata": {"name": "e1", "namespace": "a", "resourceVersion": "1"}});
        h.record("Event", ChangeOp::Add, None, Some(&ev));
        assert!(h.query(&HistoryQuery::default()).is_empty());
        assert_eq!(
            h.query(&HistoryQuery {
                include_raw_events: true,
                ..Default::default()
            })
            .len(),
            1
        );
    }

    #[test]
    fn query_filters_and_since() {
        let h = ChangeHistory::new(100, None).unwrap();
        for (ns, name) in [("a", "p1"), ("b", "p2"), ("a", "p3")] {
            let obj = json!({"metadata": {"name": name, "namespace": ns, "resourceVersion": "1"},
                "status": {"phase": "Running"}});
            h.record("Pod", ChangeOp::Add, None, Some(&obj));
        }
        let in_a = h.query(&HistoryQuery {
            namespace: Some("a".into()),
            ..Default::default()
        });
        assert_eq!(in_a.len(), 2);

        let since = h.query(&HistoryQuery {
            since: Some(2),
            ..Default::default()
        });
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].name, "p3");
    }

    #[test]
    fn persists_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let h = ChangeHistory::new(100, Some(path.clone())).unwrap();
        let obj = json!({"metadata": {"name": "p", "namespace": "a", "resourceVersion": "1"},
            "status": {"phase": "Running"}});
        h.record("Pod", ChangeOp::Add, None, Some(&obj));
        h.record("Pod", ChangeOp::Delete, Some(&obj), None);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: ChangeRecord = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.kind, "Pod");
        }
    }
}
