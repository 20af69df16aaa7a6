//! Single source of truth for NATS subjects, stream names and durable
//! consumer names, preventing mismatches between publishers and consumers.

/// Start-work requests, consumed by the deployer's durable queue group.
pub const START: &str = "deployer.start";

/// Stop requests, plain (non-durable) pub/sub.
pub const STOP: &str = "deployer.stop";

/// Job phase events, consumed by the status router and the TTL tracker.
pub const STATUS: &str = "deployer.status";

/// Global completion notifications.
pub const DONE: &str = "deployer.done";

/// Prefix for per-job output subjects.
pub const OUTPUT_PREFIX: &str = "deployer.output";

/// Status-store request-reply subjects exposed by the control plane.
pub const CONTROL_STATUS_UPDATE: &str = "control.status.update";
pub const CONTROL_STATUS_LOOKUP: &str = "control.status.lookup";
pub const CONTROL_SNAPSHOT_GENERATE: &str = "control.snapshot.generate";

/// Work-queue stream holding start requests.
pub const JOBS_STREAM: &str = "STAMPEDE_JOBS";

/// Limits-retention stream holding phase events; replayable by multiple
/// independent durable consumers.
pub const STATUS_STREAM: &str = "STAMPEDE_STATUS";

/// Limits-retention stream holding per-job output and done markers.
pub const OUTPUT_STREAM: &str = "STAMPEDE_OUTPUT";

/// Output subject for one job.
#[inline]
pub fn output_subject(id: &str) -> String {
    format!("{}.{}", OUTPUT_PREFIX, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_subject_is_scoped_by_job_id() {
        assert_eq!(output_subject("g1"), "deployer.output.g1");
    }

    #[test]
    fn subjects_share_the_deployer_prefix() {
        for subject in [START, STOP, STATUS, DONE, OUTPUT_PREFIX] {
            assert!(subject.starts_with("deployer."));
        }
    }
}
