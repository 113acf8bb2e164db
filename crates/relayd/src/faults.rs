//! Single fault ingress for the whole process.
//!
//! Instead of runtime-global hooks, every component reports faults into
//! one mpsc channel with an origin tag; the recovery controller's
//! dispatcher owns the receiving end and decides escalation. Reporting
//! never fails outward - a closed channel is logged and the fault dropped,
//! since that only happens during shutdown.

use relay_core::Fault;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Default buffer for the fault channel; faults are rare and small.
const FAULT_BUFFER: usize = 64;

/// Creates the process-wide fault channel.
///
/// The receiver goes to the recovery controller's dispatcher; the sender
/// is cloned into every component that can observe a fault.
pub fn fault_channel() -> (FaultSender, mpsc::Receiver<Fault>) {
    let (tx, rx) = mpsc::channel(FAULT_BUFFER);
    (FaultSender(tx), rx)
}

/// Cheap-to-clone reporting side of the fault channel.
#[derive(Clone)]
pub struct FaultSender(mpsc::Sender<Fault>);

impl FaultSender {
    /// Reports a fault; never raises.
    pub async fn report(&self, fault: Fault) {
        debug!(origin = %fault.origin, message = %fault.message, "Fault reported");
        if self.0.send(fault).await.is_err() {
            error!("Fault channel closed, dropping fault report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_delivers_fault() {
        let (sender, mut rx) = fault_channel();

        sender
            .report(Fault::session("bulk start failed", "no tenants"))
            .await;

        let fault = rx.recv().await.expect("fault delivered");
        assert_eq!(fault.message, "bulk start failed");
    }

    #[tokio::test]
    async fn test_report_swallows_closed_channel() {
        let (sender, rx) = fault_channel();
        drop(rx);

        // Must not panic or error
        sender.report(Fault::process("late fault", "")).await;
    }
}
