use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::bridge::GpibBridge;
use crate::events::EventKind;
use crate::ids::AcceptedIdSet;
use super::handshake::{configure, HandshakeOptions};
use super::sort::{AcceptedSetDecider, BinAssignment, BinConfig, BinDecider, SortSession, SortState};
use super::{HandlerError, PollConfig, StatusPoller};

/// One lot: which handler, which parts pass, how many parts to sort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub bus_address: u8,
    pub accepted: AcceptedIdSet,
    pub num_parts: usize,
    #[serde(default)]
    pub bins: BinConfig,
    /// The caller already consumed the first part-ready SRQ
    #[serde(default)]
    pub srq_consumed: bool,
}

impl JobSpec {
    /// One part per accepted identifier
    pub fn for_accepted(bus_address: u8, accepted: AcceptedIdSet, bins: BinConfig) -> Self {
        Self {
            bus_address,
            num_parts: accepted.len(),
            accepted,
            bins,
            srq_consumed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub poll: PollConfig,
    pub handshake: HandshakeOptions,
    pub inter_command_delay_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            handshake: HandshakeOptions::default(),
            inter_command_delay_ms: 200,
        }
    }
}

impl JobOptions {
    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Configuring,
    Sorting(SortState),
}

/// A job stopped early. Parts sorted before the failure are kept in `sorted`.
#[derive(Debug, thiserror::Error)]
#[error("job aborted at part {part} of {num_parts} ({phase:?}): {source}")]
pub struct JobError {
    /// 1-based index of the part being sorted, 0 while configuring
    pub part: usize,
    pub num_parts: usize,
    pub phase: JobPhase,
    pub sorted: Vec<BinAssignment>,
    #[source]
    pub source: HandlerError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub sorted: Vec<BinAssignment>,
    pub requested: usize,
    pub passed: usize,
    pub failed: usize,
}

impl JobReport {
    fn new(sorted: Vec<BinAssignment>, requested: usize, bins: &BinConfig) -> Self {
        let passed = sorted.iter().filter(|a| a.bin == bins.pass_bin).count();
        Self {
            failed: sorted.len() - passed,
            passed,
            requested,
            sorted,
        }
    }
}

/// Configure the handler at `spec.bus_address` and sort `spec.num_parts` parts against the accepted set
pub async fn run_job(bridge: &mut GpibBridge, spec: &JobSpec, options: &JobOptions) -> Result<JobReport, JobError> {
    let decider = AcceptedSetDecider::new(spec.accepted.clone());
    run_job_with(bridge, spec, options, Box::new(decider)).await
}

/// [`run_job`] with a caller-supplied bin decision
pub async fn run_job_with(
    bridge: &mut GpibBridge,
    spec: &JobSpec,
    options: &JobOptions,
    decider: Box<dyn BinDecider>,
) -> Result<JobReport, JobError> {
    let configuring = |source| JobError {
        part: 0,
        num_parts: spec.num_parts,
        phase: JobPhase::Configuring,
        sorted: Vec::new(),
        source,
    };

    spec.bins.validate().map_err(configuring)?;

    log::info!(
        "Starting job: {} parts, {} accepted IDs, handler at GPIB address {}",
        spec.num_parts,
        spec.accepted.len(),
        spec.bus_address
    );

    let mut poller = StatusPoller::new(options.poll.clone());
    configure(bridge, &mut poller, spec.bus_address, &options.handshake)
        .await
        .map_err(configuring)?;

    let mut session = SortSession::with_decider(decider, spec.bins)
        .with_inter_command_delay(options.inter_command_delay());
    if spec.srq_consumed {
        session.mark_srq_consumed();
    }

    let mut sorted = Vec::with_capacity(spec.num_parts);
    for index in 0..spec.num_parts {
        log::info!("Sorting part {}/{}", index + 1, spec.num_parts);
        match session.run_cycle(bridge, &mut poller).await {
            Ok(assignment) => {
                bridge.emit(EventKind::PartSorted {
                    index,
                    identifier: assignment.identifier.clone(),
                    bin: assignment.bin,
                });
                sorted.push(assignment);
            }
            Err(source) => {
                return Err(JobError {
                    part: index + 1,
                    num_parts: spec.num_parts,
                    phase: JobPhase::Sorting(session.failed_at().unwrap_or(SortState::Error)),
                    sorted,
                    source,
                });
            }
        }
    }

    bridge.emit(EventKind::JobFinished { sorted: sorted.len(), requested: spec.num_parts });
    let report = JobReport::new(sorted, spec.num_parts, &spec.bins);
    log::info!("Job finished: {} passed, {} failed", report.passed, report.failed);
    Ok(report)
}
