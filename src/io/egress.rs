//! Snapshot egress - appends count snapshots to a file
//!
//! Snapshots are written in JSONL format (one JSON document per line)
//! to the file specified in config.

use crate::domain::snapshot::CountSnapshot;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Egress writer for count snapshots
pub struct Egress {
    file_path: String,
    site_id: Option<String>,
}

impl Egress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string(), site_id: None }
    }

    /// Tag every written document with a site identifier
    pub fn with_site(mut self, site_id: &str) -> Self {
        self.site_id = Some(site_id.to_string());
        self
    }

    /// Write a snapshot to the egress file
    /// Returns true if successful, false otherwise
    pub fn write_snapshot(&self, snapshot: &CountSnapshot) -> bool {
        let json = match &self.site_id {
            Some(site) => snapshot.to_json_with_site(site),
            None => snapshot.to_json(),
        };

        match self.append_line(&json) {
            Ok(()) => {
                debug!(id = %snapshot.id, window = %snapshot.window, "snapshot_egressed");
                true
            }
            Err(e) => {
                error!(
                    id = %snapshot.id,
                    window = %snapshot.window,
                    error = %e,
                    "snapshot_egress_failed"
                );
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        Ok(())
    }
}
