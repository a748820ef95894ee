//! Subdomain registry for the rtunnel relay
//!
//! Maps public names to live tunnel connections. Every mutation happens
//! under the registry's write lock, so choosing a free name and claiming it
//! is atomic with respect to concurrent registrations and lookups.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rtunnel_shared::{Error, Result};
use tokio::sync::{mpsc, RwLock};

use crate::tunnel::{ClientConnection, ConnectionId};

const WORDS: &[&str] = &[
    "apple",
    "banana",
    "cherry",
    "date",
    "elderberry",
    "fig",
    "grape",
    "honeydew",
    "alpha",
    "beta",
    "gamma",
    "delta",
    "epsilon",
    "zeta",
    "eta",
    "theta",
];

const MAX_SUFFIX: u32 = 999;

/// Where public names come from
#[derive(Debug, Clone)]
pub enum NamePool {
    /// First free entry wins
    Reserved(Vec<String>),
    /// `word + number`, retried until unused
    Generated,
}

/// Registry mapping names to client connections
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<ClientConnection>>>,
    pool: NamePool,
}

impl ClientRegistry {
    pub fn new(reserved: Vec<String>) -> Self {
        let pool = if reserved.is_empty() {
            NamePool::Generated
        } else {
            NamePool::Reserved(reserved)
        };
        Self {
            clients: RwLock::new(HashMap::new()),
            pool,
        }
    }

    /// Assign a name to a new connection writing to `tx`.
    pub async fn register(&self, tx: mpsc::Sender<Vec<u8>>) -> Result<Arc<ClientConnection>> {
        let mut clients = self.clients.write().await;
        let name = self.next_name(&clients)?;
        let conn = Arc::new(ClientConnection::new(name.clone(), tx));
        clients.insert(name.to_ascii_lowercase(), conn.clone());
        Ok(conn)
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<ClientConnection>> {
        let clients = self.clients.read().await;
        clients.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Any registered connection, used for requests without a subdomain.
    pub async fn lookup_any(&self) -> Option<Arc<ClientConnection>> {
        let clients = self.clients.read().await;
        clients.values().next().cloned()
    }

    /// Release `name` if it still belongs to connection `id`.
    pub async fn unregister(&self, name: &str, id: ConnectionId) -> bool {
        let mut clients = self.clients.write().await;
        let key = name.to_ascii_lowercase();
        match clients.get(&key) {
            Some(conn) if conn.id() == id => {
                clients.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    fn next_name(&self, clients: &HashMap<String, Arc<ClientConnection>>) -> Result<String> {
        match &self.pool {
            NamePool::Reserved(names) => names
                .iter()
                .find(|name| !clients.contains_key(&name.to_ascii_lowercase()))
                .cloned()
                .ok_or(Error::NameExhausted),
            NamePool::Generated => {
                if clients.len() >= WORDS.len() * MAX_SUFFIX as usize {
                    return Err(Error::NameExhausted);
                }
                let mut rng = rand::thread_rng();
                loop {
                    let name = generate_name(&mut rng);
                    if !clients.contains_key(&name) {
                        return Ok(name);
                    }
                }
            }
        }
    }
}

fn generate_name<R: Rng>(rng: &mut R) -> String {
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{}{}", word, rng.gen_range(1..=MAX_SUFFIX))
}
