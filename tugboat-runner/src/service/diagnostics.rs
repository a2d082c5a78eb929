//! Diagnostics collection
//!
//! Gathers everything useful for explaining a failed stage: ingress and
//! application logs, workload status, the cluster event feed, raw TCP probes
//! of the well-known ports and one HTTP request to the public entry point.
//!
//! Collection never fails. Each sub-probe records its own failure in the
//! report and the remaining probes still run.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use tugboat_core::domain::diagnostics::{DiagnosticsReport, PortProbe, Probe};

use crate::config::Config;
use crate::remote::ClusterHandle;
use crate::service::verify::HttpProbe;

/// Assembles a [`DiagnosticsReport`] from the cluster and the network
pub struct DiagnosticsCollector {
    ports: Vec<u16>,
    log_tail_lines: u32,
    probe_timeout: Duration,
    ingress_namespace: String,
    ingress_selector: String,
    app_namespace: String,
    app_selector: String,
    http_path: String,
    http: Arc<dyn HttpProbe>,
}

impl DiagnosticsCollector {
    pub fn new(config: &Config, http: Arc<dyn HttpProbe>) -> Self {
        Self {
            ports: config.diagnostics.ports.clone(),
            log_tail_lines: config.diagnostics.log_tail_lines,
            probe_timeout: Duration::from_secs(config.diagnostics.probe_timeout_secs.max(1)),
            ingress_namespace: config.cluster.ingress_namespace.clone(),
            ingress_selector: config.cluster.ingress_selector.clone(),
            app_namespace: config.deployment.namespace.clone(),
            app_selector: format!("app={}", config.deployment.name),
            http_path: config.verify.path.clone(),
            http,
        }
    }

    /// Collects a report
    ///
    /// # Arguments
    /// * `cluster` - Cluster handle, when the instance was confirmed reachable
    /// * `address` - Public address of the instance, when known
    pub async fn collect(
        &self,
        cluster: Option<&ClusterHandle>,
        address: Option<&str>,
    ) -> DiagnosticsReport {
        info!(
            "Collecting diagnostics (address={}, cluster={})",
            address.unwrap_or("<unknown>"),
            cluster.map(|c| c.target()).unwrap_or_else(|| "<none>".to_string())
        );

        let report = match cluster {
            Some(cluster) => self.collect_from_cluster(cluster, address).await,
            None => {
                let skipped = "instance was never reachable over ssh";
                DiagnosticsReport {
                    collected_at: Utc::now(),
                    address: address.map(str::to_string),
                    ingress_logs: Probe::Skipped(skipped.to_string()),
                    application_logs: Probe::Skipped(skipped.to_string()),
                    workload_status: Probe::Skipped(skipped.to_string()),
                    events: Probe::Skipped(skipped.to_string()),
                    port_probes: self.probe_ports(address).await,
                    http_probe: self.probe_http(address).await,
                }
            }
        };

        let failed = report.failed_fields();
        if failed.is_empty() {
            info!("Diagnostics collected");
        } else {
            warn!("Diagnostics incomplete, no data for: {}", failed.join(", "));
        }
        report
    }

    async fn collect_from_cluster(
        &self,
        cluster: &ClusterHandle,
        address: Option<&str>,
    ) -> DiagnosticsReport {
        let ingress_logs = cluster
            .logs(
                &self.ingress_namespace,
                &self.ingress_selector,
                self.log_tail_lines,
            )
            .await;
        let application_logs = cluster
            .logs(&self.app_namespace, &self.app_selector, self.log_tail_lines)
            .await;
        let workload_status = cluster
            .workload_status(&self.app_namespace, &self.app_selector)
            .await;
        let events = cluster.events().await;

        DiagnosticsReport {
            collected_at: Utc::now(),
            address: address.map(str::to_string),
            ingress_logs: Probe::from_result(ingress_logs),
            application_logs: Probe::from_result(application_logs),
            workload_status: Probe::from_result(workload_status),
            events: Probe::from_result(events),
            port_probes: self.probe_ports(address).await,
            http_probe: self.probe_http(address).await,
        }
    }

    async fn probe_ports(&self, address: Option<&str>) -> Vec<PortProbe> {
        let mut probes = Vec::with_capacity(self.ports.len());
        for &port in &self.ports {
            let result = match address {
                Some(address) => self.probe_port(address, port).await,
                None => Probe::Skipped("address unknown".to_string()),
            };
            probes.push(PortProbe { port, result });
        }
        probes
    }

    async fn probe_port(&self, address: &str, port: u16) -> Probe<()> {
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(_)) => {
                debug!("{}:{} open", address, port);
                Probe::Collected(())
            }
            Ok(Err(e)) => Probe::Failed(e.to_string()),
            Err(_) => Probe::Failed(format!("no answer within {:?}", self.probe_timeout)),
        }
    }

    async fn probe_http(&self, address: Option<&str>) -> Probe<u16> {
        let Some(address) = address else {
            return Probe::Skipped("address unknown".to_string());
        };
        let url = format!("http://{}{}", address, self.http_path);
        Probe::from_result(self.http.status(&url, self.probe_timeout).await)
    }
}
