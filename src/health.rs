use std::time::Duration;

use serde::Serialize;

use crate::config::ProbeConfig;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub name: String,
    pub url: String,
    pub up: bool,
    pub detail: String,
}

/// Call every configured probe in order. A probe is up when it answers with its expected status.
pub async fn check_services(client: &reqwest::Client, probes: &[ProbeConfig]) -> Vec<ProbeReport> {
    let mut reports = Vec::with_capacity(probes.len());

    for probe in probes {
        let (up, detail) = match client.get(&probe.url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                (status == probe.expect_status, format!("HTTP {status}"))
            }
            Err(e) => (false, e.to_string()),
        };

        if up {
            tracing::info!(service = %probe.name, detail = %detail, "Service is up");
        } else {
            tracing::warn!(service = %probe.name, url = %probe.url, detail = %detail, "Service is down");
        }

        reports.push(ProbeReport {
            name: probe.name.clone(),
            url: probe.url.clone(),
            up,
            detail,
        });
    }

    reports
}
