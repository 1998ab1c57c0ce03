use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PartialFailure;

/// Append-only record of debits that did not complete.
///
/// Each line is one JSON entry. An incident stays open until a `resolved`
/// entry with the same id is appended by an operator.
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry")]
pub enum JournalEntry {
    #[serde(rename = "partial_failure")]
    PartialFailure {
        ts: i64,
        incident_id: String,
        failure: PartialFailure,
    },
    #[serde(rename = "resolved")]
    Resolved {
        ts: i64,
        incident_id: String,
        note: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenIncident {
    pub ts: i64,
    pub incident_id: String,
    pub failure: PartialFailure,
}

impl Journal {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn append_entry(&mut self, entry: &JournalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()
    }

    pub fn record_failure(&mut self, ts: i64, incident_id: &str, failure: &PartialFailure) -> std::io::Result<()> {
        self.append_entry(&JournalEntry::PartialFailure {
            ts,
            incident_id: incident_id.to_string(),
            failure: failure.clone(),
        })
    }

    pub fn resolve(&mut self, ts: i64, incident_id: &str, note: &str) -> std::io::Result<()> {
        self.append_entry(&JournalEntry::Resolved {
            ts,
            incident_id: incident_id.to_string(),
            note: note.to_string(),
        })
    }

    /// Read every parseable entry; unreadable lines are skipped.
    pub fn replay(path: &str) -> std::io::Result<Vec<JournalEntry>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(reader
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }

    /// Incidents with no matching `resolved` entry, oldest first.
    pub fn open_incidents(path: &str) -> std::io::Result<Vec<OpenIncident>> {
        let entries = Self::replay(path)?;
        let resolved: HashSet<String> = entries
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Resolved { incident_id, .. } => Some(incident_id.clone()),
                _ => None,
            })
            .collect();
        Ok(entries
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::PartialFailure { ts, incident_id, failure }
                    if !resolved.contains(&incident_id) =>
                {
                    Some(OpenIncident { ts, incident_id, failure })
                }
                _ => None,
            })
            .collect())
    }
}
