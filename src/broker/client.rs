use std::collections::HashMap;
use std::sync::Mutex;

use crate::transport::message::{ClientRecord, Confirmation};
use crate::utils::lock;

/// Register: the id is taken. Deregister: the id is unknown.
pub const CLIENT_CONFLICT: i32 = 1;

/// Called with the client id after a client has been removed.
pub type DeregisterHook = Box<dyn Fn(&str) + Send + Sync>;

/// Client id to [`ClientRecord`] map.
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, ClientRecord>>,
    on_deregister: DeregisterHook,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &lock(&self.clients).len())
            .finish()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(Box::new(|_| {}))
    }
}

impl ClientRegistry {
    pub fn new(on_deregister: DeregisterHook) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            on_deregister,
        }
    }

    /// Inserts a record. An existing id is never overwritten.
    pub fn register(&self, record: ClientRecord) -> Confirmation {
        let mut clients = lock(&self.clients);
        if clients.contains_key(&record.client_id) {
            return Confirmation::rejected(
                CLIENT_CONFLICT,
                format!("client {} is already registered", record.client_id),
            );
        }
        let status = format!("registered {}", record.client_id);
        clients.insert(record.client_id.clone(), record);
        Confirmation::ok(status)
    }

    /// Removes a client, then runs the deregistration hook outside the lock.
    pub fn deregister(&self, client_id: &str) -> Confirmation {
        let removed = lock(&self.clients).remove(client_id);
        if removed.is_none() {
            return Confirmation::rejected(
                CLIENT_CONFLICT,
                format!("client {client_id} is not registered"),
            );
        }
        (self.on_deregister)(client_id);
        Confirmation::ok(format!("deregistered {client_id}"))
    }

    pub fn get(&self, client_id: &str) -> Option<ClientRecord> {
        lock(&self.clients).get(client_id).cloned()
    }

    /// All records, sorted by client id.
    pub fn list(&self) -> Vec<ClientRecord> {
        let mut clients: Vec<ClientRecord> = lock(&self.clients).values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    pub fn len(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
