//! Scheduler plumbing for live connections.

use hopper_scheduler::SchedulerDeps;
use hopper_transport::messages::{BrokerToClient, BrokerToWorker};
use tokio::sync::mpsc::UnboundedSender;

/// Hands scheduler output to each connection's writer task. A send fails
/// only once the connection is gone, and its disconnect message is already
/// on the way to the scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughDeps;

impl SchedulerDeps for PassThroughDeps {
    type ClientSender = UnboundedSender<BrokerToClient>;
    type WorkerSender = UnboundedSender<BrokerToWorker>;

    fn send_to_client(&mut self, sender: &mut Self::ClientSender, msg: BrokerToClient) {
        let _ = sender.send(msg);
    }

    fn send_to_worker(&mut self, sender: &mut Self::WorkerSender, msg: BrokerToWorker) {
        let _ = sender.send(msg);
    }
}

pub type BrokerMessage = hopper_scheduler::Message<PassThroughDeps>;
