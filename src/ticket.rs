use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::AbortHandle;

pub type TicketId = u64;

struct Ticket {
    id: TicketId,
    handle: AbortHandle,
}

/// Keyed set of cancelable scheduled tasks, at most one per key.
///
/// A task that fires should call [`TicketMap::remove_if`] with its own id
/// before acting, so a stale fire never evicts a newer ticket.
pub struct TicketMap<K> {
    next_id: AtomicU64,
    tickets: Mutex<HashMap<K, Ticket>>,
}

impl<K> Default for TicketMap<K> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tickets: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> TicketMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn tickets(&self) -> std::sync::MutexGuard<'_, HashMap<K, Ticket>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the task built by `make` unless `key` already has a ticket.
    pub fn insert_if_absent<F, Fut>(&self, key: K, make: F) -> Option<TicketId>
    where
        F: FnOnce(TicketId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tickets = self.tickets();
        if tickets.contains_key(&key) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(make(id)).abort_handle();
        tickets.insert(key, Ticket { id, handle });
        Some(id)
    }

    /// Spawn a new ticket for `key`, aborting whatever was there.
    pub fn replace<F, Fut>(&self, key: K, make: F) -> TicketId
    where
        F: FnOnce(TicketId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tickets = self.tickets();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(make(id)).abort_handle();
        if let Some(previous) = tickets.insert(key, Ticket { id, handle }) {
            previous.handle.abort();
        }
        id
    }

    /// Abort and forget the ticket for `key`. Returns whether one existed.
    pub fn cancel(&self, key: &K) -> bool {
        match self.tickets().remove(key) {
            Some(ticket) => {
                ticket.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the ticket for `key` only if it is still ticket `id`.
    pub fn remove_if(&self, key: &K, id: TicketId) -> bool {
        let mut tickets = self.tickets();
        if tickets.get(key).is_some_and(|t| t.id == id) {
            tickets.remove(key);
            true
        } else {
            false
        }
    }

    pub fn is_current(&self, key: &K, id: TicketId) -> bool {
        self.tickets().get(key).is_some_and(|t| t.id == id)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.tickets().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tickets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        for (_, ticket) in self.tickets().drain() {
            ticket.handle.abort();
        }
    }
}

impl<K> Drop for TicketMap<K> {
    fn drop(&mut self) {
        let tickets = self.tickets.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, ticket) in tickets.drain() {
            ticket.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_ticket(
        map: &Arc<TicketMap<&'static str>>,
        key: &'static str,
        fired: &Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl FnOnce(TicketId) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        let map = map.clone();
        let fired = fired.clone();
        move |id| {
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if map.remove_if(&key, id) {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_if_absent_dedupes() {
        let map = Arc::new(TicketMap::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_secs(60);

        assert!(
            map.insert_if_absent("lobby", counting_ticket(&map, "lobby", &fired, delay))
                .is_some()
        );
        assert!(
            map.insert_if_absent("lobby", counting_ticket(&map, "lobby", &fired, delay))
                .is_none()
        );
        assert_eq!(map.len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let map = Arc::new(TicketMap::new());
        let fired = Arc::new(AtomicUsize::new(0));
        map.insert_if_absent(
            "lobby",
            counting_ticket(&map, "lobby", &fired, Duration::from_secs(5)),
        );

        assert!(map.cancel(&"lobby"));
        assert!(!map.cancel(&"lobby"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fire_does_not_evict_newer_ticket() {
        let map: TicketMap<&str> = TicketMap::new();
        let old = map
            .insert_if_absent("smp", |_| async {})
            .unwrap();
        map.cancel(&"smp");
        let new = map.insert_if_absent("smp", |_| async {}).unwrap();

        assert!(!map.remove_if(&"smp", old));
        assert!(map.is_current(&"smp", new));
        assert!(map.remove_if(&"smp", new));
        assert!(!map.contains(&"smp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_aborts_previous() {
        let map = Arc::new(TicketMap::new());
        let fired = Arc::new(AtomicUsize::new(0));
        map.replace("smp", counting_ticket(&map, "smp", &fired, Duration::from_secs(5)));
        map.replace("smp", counting_ticket(&map, "smp", &fired, Duration::from_secs(20)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let map = Arc::new(TicketMap::new());
        let fired = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            map.insert_if_absent(key, counting_ticket(&map, key, &fired, Duration::from_secs(1)));
        }
        map.cancel_all();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(map.is_empty());
    }
}
