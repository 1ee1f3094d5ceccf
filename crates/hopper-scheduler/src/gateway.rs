//! Client gateway.
//!
//! Tracks connected clients and which of their submissions are waiting on
//! which job. Identical submissions, from one client or several, share a
//! single job and each gets its own response. A job's subscribers are taken
//! exactly once when it terminates, so a duplicated result from a worker can
//! never reach a client twice.

use hopper_core::{ClientId, ClientJobId, JobId};
use std::collections::HashMap;

#[derive(Debug)]
struct ClientState<S> {
    sender: S,
    pending: HashMap<ClientJobId, JobId>,
}

#[derive(Debug)]
pub struct ClientGateway<S> {
    clients: HashMap<ClientId, ClientState<S>>,
    subscribers: HashMap<JobId, Vec<(ClientId, ClientJobId)>>,
}

impl<S> Default for ClientGateway<S> {
    fn default() -> Self {
        Self {
            clients: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }
}

impl<S> ClientGateway<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, id: ClientId, sender: S) {
        self.clients.insert(
            id,
            ClientState {
                sender,
                pending: HashMap::new(),
            },
        );
    }

    /// Forget a client. Returns the jobs that no longer have any subscriber.
    pub fn disconnect(&mut self, id: &ClientId) -> Vec<JobId> {
        let Some(state) = self.clients.remove(id) else {
            return Vec::new();
        };
        let mut orphaned = Vec::new();
        for (client_job_id, job_id) in state.pending {
            if self.drop_subscriber(&job_id, (*id, client_job_id)) {
                orphaned.push(job_id);
            }
        }
        orphaned
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn sender_mut(&mut self, id: &ClientId) -> Option<&mut S> {
        self.clients.get_mut(id).map(|c| &mut c.sender)
    }

    /// Whether `client_job_id` is still waiting for a result.
    pub fn is_pending(&self, client: &ClientId, client_job_id: &ClientJobId) -> bool {
        self.clients
            .get(client)
            .is_some_and(|c| c.pending.contains_key(client_job_id))
    }

    pub fn subscribe(&mut self, client: ClientId, client_job_id: ClientJobId, job_id: JobId) {
        if let Some(state) = self.clients.get_mut(&client) {
            state.pending.insert(client_job_id, job_id);
            self.subscribers
                .entry(job_id)
                .or_default()
                .push((client, client_job_id));
        }
    }

    /// Withdraw one submission. Returns its job and whether that job has no
    /// subscribers left.
    pub fn unsubscribe(
        &mut self,
        client: &ClientId,
        client_job_id: &ClientJobId,
    ) -> Option<(JobId, bool)> {
        let job_id = self.clients.get_mut(client)?.pending.remove(client_job_id)?;
        let orphaned = self.drop_subscriber(&job_id, (*client, *client_job_id));
        Some((job_id, orphaned))
    }

    /// Everyone waiting on `job_id`, removed so they are only notified once.
    pub fn take_subscribers(&mut self, job_id: &JobId) -> Vec<(ClientId, ClientJobId)> {
        let subscribers = self.subscribers.remove(job_id).unwrap_or_default();
        for (client, client_job_id) in &subscribers {
            if let Some(state) = self.clients.get_mut(client) {
                state.pending.remove(client_job_id);
            }
        }
        subscribers
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.subscribers.get(job_id).map_or(0, Vec::len)
    }

    fn drop_subscriber(&mut self, job_id: &JobId, who: (ClientId, ClientJobId)) -> bool {
        let Some(list) = self.subscribers.get_mut(job_id) else {
            return true;
        };
        list.retain(|s| *s != who);
        if list.is_empty() {
            self.subscribers.remove(job_id);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopper_core::{Digest, ResourceId};

    fn job(n: u8) -> JobId {
        JobId(Digest::of(&[n]))
    }

    #[test]
    fn test_shared_job_notifies_each_subscriber_once() {
        let mut gateway = ClientGateway::new();
        let (a, b) = (ClientId(ResourceId::new()), ClientId(ResourceId::new()));
        gateway.connect(a, ());
        gateway.connect(b, ());

        gateway.subscribe(a, ClientJobId(1), job(1));
        gateway.subscribe(b, ClientJobId(9), job(1));
        assert_eq!(gateway.subscriber_count(&job(1)), 2);

        let subs = gateway.take_subscribers(&job(1));
        assert_eq!(subs.len(), 2);
        assert!(!gateway.is_pending(&a, &ClientJobId(1)));
        assert!(gateway.take_subscribers(&job(1)).is_empty());
    }

    #[test]
    fn test_unsubscribe_reports_orphans() {
        let mut gateway = ClientGateway::new();
        let (a, b) = (ClientId(ResourceId::new()), ClientId(ResourceId::new()));
        gateway.connect(a, ());
        gateway.connect(b, ());
        gateway.subscribe(a, ClientJobId(1), job(1));
        gateway.subscribe(b, ClientJobId(1), job(1));

        assert_eq!(gateway.unsubscribe(&a, &ClientJobId(1)), Some((job(1), false)));
        assert_eq!(gateway.unsubscribe(&a, &ClientJobId(1)), None);
        assert_eq!(gateway.unsubscribe(&b, &ClientJobId(1)), Some((job(1), true)));
    }

    #[test]
    fn test_disconnect_orphans_only_unshared_jobs() {
        let mut gateway = ClientGateway::new();
        let (a, b) = (ClientId(ResourceId::new()), ClientId(ResourceId::new()));
        gateway.connect(a, ());
        gateway.connect(b, ());
        gateway.subscribe(a, ClientJobId(1), job(1));
        gateway.subscribe(a, ClientJobId(2), job(2));
        gateway.subscribe(b, ClientJobId(1), job(2));

        let orphaned = gateway.disconnect(&a);
        assert_eq!(orphaned, vec![job(1)]);
        assert!(!gateway.contains(&a));
        assert_eq!(gateway.subscriber_count(&job(2)), 1);
    }
}
