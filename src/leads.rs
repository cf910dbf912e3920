//! Lead capture for the marketing site's demo-request form.
//!
//! Submissions are validated, then forwarded to the log sink: a structured
//! tracing record plus an append-only JSONL file. No CRM integration; the
//! file is the handoff point for whatever consumes leads downstream.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

/// Minimal shape check; deliverability is the mail provider's problem
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// A demo-request submission from the marketing site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
}

/// Validate a submission, returning a user-facing message on failure
pub fn validate(lead: &Lead) -> Result<(), &'static str> {
    if lead.name.trim().is_empty()
        || lead.phone.trim().is_empty()
        || lead.email.trim().is_empty()
    {
        return Err("All fields are required");
    }
    if !EMAIL_RE.is_match(lead.email.trim()) {
        return Err("Enter a valid email address");
    }
    Ok(())
}

/// One line in the leads file
#[derive(Debug, Serialize, Deserialize)]
struct LeadRecord {
    #[serde(flatten)]
    lead: Lead,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
}

/// Append-only JSONL sink for captured leads
pub struct LeadSink {
    path: PathBuf,
}

impl LeadSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Record a validated lead
    pub fn record(
        &self,
        lead: &Lead,
        user_agent: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let record = LeadRecord {
            lead: lead.clone(),
            timestamp: Utc::now().to_rfc3339(),
            user_agent,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(&record)?;
        writeln!(file, "{}", line)?;

        info!("New demo lead recorded: {} <{}>", record.lead.name, record.lead.email);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(name: &str, phone: &str, email: &str) -> Lead {
        Lead {
            name: name.to_string(),
            phone: phone.to_string(),
            email: email.to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_complete_lead() {
        assert!(validate(&lead("Ada", "+1 555 0100", "ada@example.com")).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        assert!(validate(&lead("", "+1 555 0100", "ada@example.com")).is_err());
        assert!(validate(&lead("Ada", "  ", "ada@example.com")).is_err());
        assert!(validate(&lead("Ada", "+1 555 0100", "")).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_email() {
        assert!(validate(&lead("Ada", "+1 555 0100", "not-an-email")).is_err());
        assert!(validate(&lead("Ada", "+1 555 0100", "a@b")).is_err());
        assert!(validate(&lead("Ada", "+1 555 0100", "a b@c.com")).is_err());
    }

    #[test]
    fn test_sink_appends_jsonl() {
        let path = std::env::temp_dir().join(format!("heron-leads-test-{}.jsonl", std::process::id()));
        let _ = fs::remove_file(&path);

        let sink = LeadSink::new(path.clone());
        sink.record(&lead("Ada", "+1 555 0100", "ada@example.com"), None)
            .unwrap();
        sink.record(
            &lead("Grace", "+1 555 0101", "grace@example.com"),
            Some("test-agent".to_string()),
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["name"], "Ada");
        assert!(first["timestamp"].is_string());
        assert!(first.get("user_agent").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["user_agent"], "test-agent");

        let _ = fs::remove_file(&path);
    }
}
