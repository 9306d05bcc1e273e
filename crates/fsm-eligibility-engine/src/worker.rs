use fsm_eligibility_core::{CheckError, CheckStatus, QueueDestination};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::AuditContext;
use crate::queue::SqliteQueue;
use crate::{EligibilityEngine, EngineError};

/// Counts for one drain pass. `failed` messages remain in the outbox and are
/// delivered again on a later pass; `rejected` checks are acknowledged and stay
/// queued until an administrator overrides them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrainReport {
    pub received: usize,
    pub resolved: usize,
    pub requeued: usize,
    pub skipped_already_resolved: usize,
    pub skipped_missing: usize,
    pub rejected: usize,
    pub failed: usize,
}

enum Disposition {
    Ack,
    Requeue,
    Retain,
}

/// Receive up to `limit` messages from `destination` and resolve each check.
///
/// A message is acknowledged only once its check is decided, already resolved,
/// missing, or rejected. A `source_error` outcome moves the message to the back
/// of the destination. Storage and queue failures leave it in place.
///
/// # Errors
/// Returns an error when the outbox cannot be read.
pub fn drain(
    engine: &EligibilityEngine,
    queue: &SqliteQueue,
    destination: QueueDestination,
    limit: usize,
    audit: &AuditContext,
) -> Result<DrainReport, EngineError> {
    let received = queue.receive(destination, limit).map_err(EngineError::Queue)?;
    let mut report = DrainReport { received: received.len(), ..DrainReport::default() };

    for item in received {
        let check_id = item.message.check_id;
        let disposition = match engine.resolve(check_id, audit) {
            Ok(CheckStatus::SourceError) => Disposition::Requeue,
            Ok(_) => {
                report.resolved += 1;
                Disposition::Ack
            }
            Err(EngineError::Check(CheckError::InvalidState { status, .. })) => {
                info!(%check_id, status = status.as_str(), "check already resolved; acknowledging");
                report.skipped_already_resolved += 1;
                Disposition::Ack
            }
            Err(EngineError::Check(CheckError::NotFound(_))) => {
                warn!(%check_id, "queued check no longer exists; acknowledging");
                report.skipped_missing += 1;
                Disposition::Ack
            }
            Err(EngineError::Check(err)) => {
                warn!(%check_id, error = %err, "check rejected; left queued for review");
                report.rejected += 1;
                Disposition::Ack
            }
            Err(err) => {
                warn!(%check_id, error = %err, "check resolution failed; message kept");
                report.failed += 1;
                Disposition::Retain
            }
        };

        let settled = match disposition {
            Disposition::Ack => queue.ack(&item),
            Disposition::Requeue => queue.requeue(&item).map(|()| report.requeued += 1),
            Disposition::Retain => Ok(()),
        };
        if let Err(err) = settled {
            warn!(%check_id, error = %err, "queue update failed; message will be redelivered");
            report.failed += 1;
        }
    }

    info!(
        destination = destination.as_str(),
        received = report.received,
        resolved = report.resolved,
        requeued = report.requeued,
        rejected = report.rejected,
        failed = report.failed,
        "queue drained"
    );
    Ok(report)
}
