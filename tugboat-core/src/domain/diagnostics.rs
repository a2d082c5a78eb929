//! Diagnostics report domain types
//!
//! A report is assembled after a stage fails. Every field is a [`Probe`] so a
//! sub-probe that fails is recorded in place instead of aborting collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Result of one best-effort diagnostic probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Probe<T> {
    Collected(T),
    Failed(String),
    /// Probe was not attempted (e.g. no cluster handle was available)
    Skipped(String),
}

impl<T> Probe<T> {
    pub fn from_result<E: std::fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Probe::Collected(value),
            Err(e) => Probe::Failed(e.to_string()),
        }
    }

    pub fn is_collected(&self) -> bool {
        matches!(self, Probe::Collected(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Probe::Collected(value) => Some(value),
            _ => None,
        }
    }
}

/// A cluster-level event, as reported by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub timestamp: Option<DateTime<Utc>>,
    /// "Normal" or "Warning"
    pub event_type: String,
    pub reason: String,
    /// Involved object, e.g. "Pod/app-7d9c"
    pub object: String,
    pub message: String,
}

/// Raw TCP reachability of one port on the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortProbe {
    pub port: u16,
    pub result: Probe<()>,
}

impl PortProbe {
    pub fn is_open(&self) -> bool {
        self.result.is_collected()
    }
}

/// Failure report gathered from the cluster and the network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub collected_at: DateTime<Utc>,
    pub address: Option<String>,
    pub ingress_logs: Probe<String>,
    pub application_logs: Probe<String>,
    pub workload_status: Probe<String>,
    /// Ordered oldest first
    pub events: Probe<Vec<ClusterEvent>>,
    pub port_probes: Vec<PortProbe>,
    /// Status code returned by `GET /`, if any response was received
    pub http_probe: Probe<u16>,
}

impl DiagnosticsReport {
    /// Names of the fields whose probe did not collect anything
    pub fn failed_fields(&self) -> Vec<String> {
        let mut failed = Vec::new();
        if !self.ingress_logs.is_collected() {
            failed.push("ingress_logs".to_string());
        }
        if !self.application_logs.is_collected() {
            failed.push("application_logs".to_string());
        }
        if !self.workload_status.is_collected() {
            failed.push("workload_status".to_string());
        }
        if !self.events.is_collected() {
            failed.push("events".to_string());
        }
        for probe in &self.port_probes {
            if !probe.is_open() {
                failed.push(format!("port_{}", probe.port));
            }
        }
        if !self.http_probe.is_collected() {
            failed.push("http_probe".to_string());
        }
        failed
    }

    /// Whether the HTTP probe received the given status
    pub fn http_probe_returned(&self, status: u16) -> bool {
        self.http_probe.value() == Some(&status)
    }

    /// Renders the report as a plain-text block for the run's log stream
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== diagnostics report ({}) ===", self.collected_at.to_rfc3339());
        let _ = writeln!(
            out,
            "address: {}",
            self.address.as_deref().unwrap_or("<unknown>")
        );

        let _ = writeln!(out, "--- port probes ---");
        for probe in &self.port_probes {
            match &probe.result {
                Probe::Collected(()) => {
                    let _ = writeln!(out, "  {:>5}  open", probe.port);
                }
                Probe::Failed(reason) | Probe::Skipped(reason) => {
                    let _ = writeln!(out, "  {:>5}  closed ({})", probe.port, reason);
                }
            }
        }

        let _ = writeln!(out, "--- http probe ---");
        let _ = writeln!(out, "  {}", describe(&self.http_probe, |s| format!("status {}", s)));

        render_text_section(&mut out, "workload status", &self.workload_status);
        render_text_section(&mut out, "ingress logs", &self.ingress_logs);
        render_text_section(&mut out, "application logs", &self.application_logs);

        let _ = writeln!(out, "--- events ---");
        match &self.events {
            Probe::Collected(events) if events.is_empty() => {
                let _ = writeln!(out, "  <no events>");
            }
            Probe::Collected(events) => {
                for event in events {
                    let when = event
                        .timestamp
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    let _ = writeln!(
                        out,
                        "  {} {} {} {}: {}",
                        when, event.event_type, event.object, event.reason, event.message
                    );
                }
            }
            other => {
                let _ = writeln!(out, "  {}", describe(other, |_| String::new()));
            }
        }

        out
    }
}

fn render_text_section(out: &mut String, title: &str, probe: &Probe<String>) {
    let _ = writeln!(out, "--- {} ---", title);
    match probe {
        Probe::Collected(text) if text.trim().is_empty() => {
            let _ = writeln!(out, "  <empty>");
        }
        Probe::Collected(text) => {
            for line in text.lines() {
                let _ = writeln!(out, "  {}", line);
            }
        }
        other => {
            let _ = writeln!(out, "  {}", describe(other, |_| String::new()));
        }
    }
}

fn describe<T>(probe: &Probe<T>, collected: impl Fn(&T) -> String) -> String {
    match probe {
        Probe::Collected(value) => collected(value),
        Probe::Failed(reason) => format!("FAILED: {}", reason),
        Probe::Skipped(reason) => format!("skipped: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> DiagnosticsReport {
        DiagnosticsReport {
            collected_at: Utc::now(),
            address: Some("203.0.113.7".to_string()),
            ingress_logs: Probe::Collected("traefik started".to_string()),
            application_logs: Probe::Failed("pod not found".to_string()),
            workload_status: Probe::Collected("app 1/1".to_string()),
            events: Probe::Collected(vec![]),
            port_probes: vec![
                PortProbe {
                    port: 22,
                    result: Probe::Collected(()),
                },
                PortProbe {
                    port: 80,
                    result: Probe::Failed("connection refused".to_string()),
                },
            ],
            http_probe: Probe::Failed("connection refused".to_string()),
        }
    }

    #[test]
    fn test_failed_fields() {
        let failed = report().failed_fields();
        assert_eq!(failed, vec!["application_logs", "port_80", "http_probe"]);
    }

    #[test]
    fn test_render_marks_failures() {
        let rendered = report().render();
        assert!(rendered.contains("traefik started"));
        assert!(rendered.contains("FAILED: pod not found"));
        assert!(rendered.contains("closed (connection refused)"));
        assert!(rendered.contains("<no events>"));
    }

    #[test]
    fn test_probe_from_result() {
        let ok: Probe<u16> = Probe::from_result(Ok::<_, String>(200));
        assert!(ok.is_collected());
        assert_eq!(ok.value(), Some(&200));

        let err: Probe<u16> = Probe::from_result(Err::<u16, _>("timeout"));
        assert_eq!(err, Probe::Failed("timeout".to_string()));
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["application_logs"]["status"], "failed");
        assert_eq!(json["http_probe"]["value"], "connection refused");
    }
}
