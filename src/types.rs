//! Core data types shared by extraction, migration and backup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An issue record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub content_hash: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub design: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(default)]
    pub notes: String,
    pub status: String,
    pub priority: i32,
    pub issue_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    /// Arbitrary JSON object stored as text.
    #[serde(default = "empty_json_object")]
    pub metadata: String,
}

/// A typed dependency edge from `issue_id` to `depends_on_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub issue_id: String,
    pub depends_on_id: String,
    /// Edge type: "blocks", "parent-child", "related", "discovered-from", or custom.
    #[serde(rename = "type")]
    pub dep_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default = "empty_json_object")]
    pub metadata: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Insertion-order tiebreaker (legacy rowid). Not part of the portable format.
    #[serde(skip)]
    pub seq: i64,
}

/// A history event attached to an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub issue_id: String,
    pub event_type: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A free-form comment on an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub issue_id: String,
    #[serde(default)]
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the labels table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRow {
    pub issue_id: String,
    pub label: String,
}

/// One row of the key/value config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub key: String,
    pub value: String,
}

fn empty_json_object() -> String {
    "{}".to_string()
}

/// Tables carried by a migration, in write order.
pub const MIGRATED_TABLES: &[&str] = &[
    "issues",
    "labels",
    "dependencies",
    "events",
    "comments",
    "config",
];

/// Row counts per migrated table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub issues: u64,
    pub labels: u64,
    pub dependencies: u64,
    pub events: u64,
    pub comments: u64,
    pub config: u64,
}

impl TableCounts {
    /// Get the count for a table by name.
    pub fn get(&self, table: &str) -> Option<u64> {
        match table {
            "issues" => Some(self.issues),
            "labels" => Some(self.labels),
            "dependencies" => Some(self.dependencies),
            "events" => Some(self.events),
            "comments" => Some(self.comments),
            "config" => Some(self.config),
            _ => None,
        }
    }

    /// Iterate `(table, count)` pairs in write order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        MIGRATED_TABLES
            .iter()
            .map(move |t| (*t, self.get(t).unwrap_or(0)))
    }

    pub fn total(&self) -> u64 {
        self.iter().map(|(_, n)| n).sum()
    }
}

/// Deterministically ordered, in-memory copy of all migratable data.
///
/// Built through [`SnapshotBuilder`], which fixes the ordering rules:
/// issues by `(created_at, id)`, per-issue dependencies by
/// `(created_at, seq)`, events and comments by `(created_at, id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub issues: Vec<Issue>,
    pub labels: BTreeMap<String, BTreeSet<String>>,
    pub dependencies: BTreeMap<String, Vec<Dependency>>,
    pub events: BTreeMap<String, Vec<Event>>,
    pub comments: BTreeMap<String, Vec<Comment>>,
    pub config: BTreeMap<String, String>,
    pub prefix: String,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
            && self.labels.is_empty()
            && self.dependencies.is_empty()
            && self.events.is_empty()
            && self.comments.is_empty()
            && self.config.is_empty()
    }

    /// Row counts as they would land in the target tables.
    pub fn counts(&self) -> TableCounts {
        TableCounts {
            issues: self.issues.len() as u64,
            labels: self.labels.values().map(|s| s.len() as u64).sum(),
            dependencies: self.dependencies.values().map(|v| v.len() as u64).sum(),
            events: self.events.values().map(|v| v.len() as u64).sum(),
            comments: self.comments.values().map(|v| v.len() as u64).sum(),
            config: self.config.len() as u64,
        }
    }

    pub fn label_rows(&self) -> impl Iterator<Item = LabelRow> + '_ {
        self.labels.iter().flat_map(|(issue_id, labels)| {
            labels.iter().map(move |label| LabelRow {
                issue_id: issue_id.clone(),
                label: label.clone(),
            })
        })
    }

    pub fn all_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.values().flatten()
    }

    pub fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.events.values().flatten()
    }

    pub fn all_comments(&self) -> impl Iterator<Item = &Comment> {
        self.comments.values().flatten()
    }
}

/// Accumulates rows in any order and produces a deterministically ordered [`Snapshot`].
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    issues: Vec<Issue>,
    labels: Vec<LabelRow>,
    dependencies: Vec<Dependency>,
    events: Vec<Event>,
    comments: Vec<Comment>,
    config: Vec<ConfigRow>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, issue: Issue) -> &mut Self {
        self.issues.push(issue);
        self
    }

    pub fn label(&mut self, row: LabelRow) -> &mut Self {
        self.labels.push(row);
        self
    }

    pub fn dependency(&mut self, dep: Dependency) -> &mut Self {
        self.dependencies.push(dep);
        self
    }

    pub fn event(&mut self, event: Event) -> &mut Self {
        self.events.push(event);
        self
    }

    pub fn comment(&mut self, comment: Comment) -> &mut Self {
        self.comments.push(comment);
        self
    }

    pub fn config(&mut self, row: ConfigRow) -> &mut Self {
        self.config.push(row);
        self
    }

    pub fn build(self) -> Snapshot {
        let mut issues = self.issues;
        issues.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut labels: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in self.labels {
            labels.entry(row.issue_id).or_default().insert(row.label);
        }

        let mut dependencies: BTreeMap<String, Vec<Dependency>> = BTreeMap::new();
        for dep in self.dependencies {
            dependencies.entry(dep.issue_id.clone()).or_default().push(dep);
        }
        for deps in dependencies.values_mut() {
            deps.sort_by_key(|d| (d.created_at, d.seq));
        }

        let mut events: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        for event in self.events {
            events.entry(event.issue_id.clone()).or_default().push(event);
        }
        for list in events.values_mut() {
            list.sort_by_key(|e| (e.created_at, e.id));
        }

        let mut comments: BTreeMap<String, Vec<Comment>> = BTreeMap::new();
        for comment in self.comments {
            comments
                .entry(comment.issue_id.clone())
                .or_default()
                .push(comment);
        }
        for list in comments.values_mut() {
            list.sort_by_key(|c| (c.created_at, c.id));
        }

        let config: BTreeMap<String, String> =
            self.config.into_iter().map(|r| (r.key, r.value)).collect();

        let prefix = derive_prefix(&config, &issues);

        Snapshot {
            issues,
            labels,
            dependencies,
            events,
            comments,
            config,
            prefix,
        }
    }
}

/// Config key holding the issue ID prefix.
pub const ISSUE_PREFIX_KEY: &str = "issue_prefix";

/// The configured prefix, or the part of the first issue ID before its last `-`.
fn derive_prefix(config: &BTreeMap<String, String>, issues: &[Issue]) -> String {
    if let Some(prefix) = config.get(ISSUE_PREFIX_KEY) {
        let prefix = prefix.trim().trim_end_matches('-');
        if !prefix.is_empty() {
            return prefix.to_string();
        }
    }
    issues
        .first()
        .and_then(|issue| issue.id.rsplit_once('-'))
        .map(|(prefix, _)| prefix.to_string())
        .unwrap_or_default()
}
