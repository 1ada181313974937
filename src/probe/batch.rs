use std::collections::BTreeSet;
use std::sync::Mutex;

use futures_util::stream::{self, StreamExt as _};
use serde::Serialize;

use super::{EndpointProber, ProbeCancel, ProbeOutcome};
use crate::catalog::EndpointRecord;

#[derive(Debug, Clone, Serialize)]
pub struct WorkingEndpoint {
    pub endpoint: EndpointRecord,
    pub elapsed_ms: u64,
}

/// Result of probing a whole catalog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    /// Probes that ran to a verdict (cancelled ones excluded).
    pub tested: usize,
    pub failed: usize,
    /// Sorted by descending throughput.
    pub working: Vec<WorkingEndpoint>,
    /// Distinct countries among working endpoints.
    pub countries: BTreeSet<String>,
    pub cancelled: bool,
    pub outcomes: Vec<ProbeOutcome>,
}

/// Probe every endpoint with at most `concurrency` engines at once.
///
/// Each in-flight probe holds its own interface slot. Cancelling stops new
/// probes from starting and tears down the running ones.
pub async fn probe_catalog(
    prober: &EndpointProber,
    endpoints: &[EndpointRecord],
    concurrency: usize,
    cancel: &ProbeCancel,
) -> ProbeReport {
    let concurrency = concurrency.max(1);
    let total = endpoints.len();
    let slots = Mutex::new((0..concurrency).rev().collect::<Vec<usize>>());

    log::info!(
        "Probing {} endpoints ({} at a time)",
        total,
        concurrency
    );

    let results: Vec<(EndpointRecord, ProbeOutcome)> = stream::iter(endpoints.iter().enumerate())
        .map(|(index, endpoint)| {
            let slots = &slots;
            async move {
                let slot = slots
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop()
                    .unwrap_or(0);
                let engine = prober.settings().slot_engine(slot);
                let outcome = prober.probe_with(&engine, endpoint, cancel).await;
                slots.lock().unwrap_or_else(|e| e.into_inner()).push(slot);

                if !outcome.is_cancelled() {
                    log::info!(
                        "[{}/{}] {} ({}): {}",
                        index + 1,
                        total,
                        endpoint.name,
                        endpoint.country,
                        if outcome.success { "working" } else { "failed" }
                    );
                }
                (endpoint.clone(), outcome)
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let report = build_report(results, cancel.is_cancelled());
    log::info!(
        "Probe sweep finished: {} tested, {} working, {} failed, {} countries",
        report.tested,
        report.working.len(),
        report.failed,
        report.countries.len()
    );
    report
}

fn build_report(results: Vec<(EndpointRecord, ProbeOutcome)>, cancelled: bool) -> ProbeReport {
    let mut report = ProbeReport {
        cancelled,
        ..ProbeReport::default()
    };

    for (endpoint, outcome) in results {
        if !outcome.is_cancelled() {
            report.tested += 1;
            if outcome.success {
                report.countries.insert(endpoint.country.clone());
                report.working.push(WorkingEndpoint {
                    endpoint,
                    elapsed_ms: outcome.elapsed_ms,
                });
            } else {
                report.failed += 1;
            }
        }
        report.outcomes.push(outcome);
    }

    report
        .working
        .sort_by(|a, b| b.endpoint.speed_mbps.total_cmp(&a.endpoint.speed_mbps));
    report
}
