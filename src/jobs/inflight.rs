use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::error;
use uuid::Uuid;

/// Task ids currently being processed in this process.
#[derive(Clone, Default)]
pub struct InFlightSet {
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

/// Holding a ticket is the right to run the task. Dropping it releases the id.
#[derive(Debug)]
pub struct InFlightTicket {
    id: Uuid,
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when another caller already holds this task.
    pub fn try_acquire(&self, id: Uuid) -> Option<InFlightTicket> {
        lock(&self.ids).insert(id).then(|| InFlightTicket {
            id,
            ids: self.ids.clone(),
        })
    }

    pub fn contains(&self, id: Uuid) -> bool {
        lock(&self.ids).contains(&id)
    }
}

impl InFlightTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        lock(&self.ids).remove(&self.id);
    }
}

// Every critical section is a single set operation; a poisoned set is still consistent.
fn lock(ids: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    ids.lock().unwrap_or_else(|poisoned| {
        error!(target = "cardforge.tasks", "inflight_lock_poisoned");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let set = InFlightSet::new();
        let id = Uuid::new_v4();
        let ticket = set.try_acquire(id).expect("first");
        assert!(set.try_acquire(id).is_none());
        assert!(set.contains(id));
        assert_eq!(ticket.id(), id);
        drop(ticket);
        assert!(!set.contains(id));
        assert!(set.try_acquire(id).is_some());
    }

    #[test]
    fn tickets_are_independent_per_task() {
        let set = InFlightSet::new();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let a = set.try_acquire(first).expect("a");
        let _b = set.try_acquire(second).expect("b");
        drop(a);
        assert!(!set.contains(first));
        assert!(set.contains(second));
    }

    #[tokio::test]
    async fn ticket_is_released_when_the_owning_task_panics() {
        let set = InFlightSet::new();
        let id = Uuid::new_v4();
        let ticket = set.try_acquire(id).expect("first");
        let handle = tokio::spawn(async move {
            let _held = ticket;
            panic!("pipeline blew up");
        });
        assert!(handle.await.is_err());
        assert!(!set.contains(id));
    }
}
