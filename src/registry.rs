//! Client registry
//!
//! Every handle a test run creates is registered here so that teardown can
//! close all of them, even handles whose sampling thread died or was
//! interrupted. One registry is shared by all virtual users of a run.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::client::Closeable;
use crate::error::MqttSamplerError;

/// Thread-safe collection of live handles.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<dyn Closeable>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handle. Callable concurrently from any sampling thread.
    pub fn register(&self, client: Arc<dyn Closeable>) {
        self.clients.lock().push(client);
    }

    /// Closes every registered handle and empties the registry.
    ///
    /// The lock is held for the whole pass, so a concurrent `register` lands
    /// either before the pass (and is closed) or after it (and is kept for
    /// the next one). A failing close never stops the pass; all failures are
    /// returned.
    pub fn close_all(&self) -> Vec<MqttSamplerError> {
        let mut clients = self.clients.lock();
        let count = clients.len();
        let errors = close_each(clients.drain(..));
        info!(
            "Closed {} client(s), {} failure(s)",
            count - errors.len(),
            errors.len()
        );
        errors
    }

    /// [`close_all`](Self::close_all), folding failures into one
    /// [`MqttSamplerError::Teardown`].
    pub fn close_all_checked(&self) -> Result<(), MqttSamplerError> {
        let errors = self.close_all();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MqttSamplerError::Teardown(errors))
        }
    }

    /// Removes and closes every handle registered under `client_id`.
    ///
    /// Used when one virtual user finishes before the rest of the run.
    /// Returns `Ok(false)` when nothing was registered under that id. Every
    /// removed handle gets a close attempt; failures come back as one
    /// [`MqttSamplerError::Teardown`].
    pub fn close_client(&self, client_id: &str) -> Result<bool, MqttSamplerError> {
        let removed: Vec<Arc<dyn Closeable>> = {
            let mut clients = self.clients.lock();
            let (matching, rest) = clients
                .drain(..)
                .partition(|client| client.client_id() == client_id);
            *clients = rest;
            matching
        };
        if removed.is_empty() {
            return Ok(false);
        }
        let errors = close_each(removed);
        if errors.is_empty() {
            Ok(true)
        } else {
            Err(MqttSamplerError::Teardown(errors))
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients
            .lock()
            .iter()
            .any(|client| client.client_id() == client_id)
    }
}

/// Closes every handle, carrying on past failures.
fn close_each(
    clients: impl IntoIterator<Item = Arc<dyn Closeable>>,
) -> Vec<MqttSamplerError> {
    let mut errors = Vec::new();
    for client in clients {
        if let Err(e) = client.close() {
            warn!("Failed to close client {}: {}", client.client_id(), e);
            errors.push(match e {
                MqttSamplerError::Close { .. } => e,
                other => MqttSamplerError::Close {
                    client_id: client.client_id().to_string(),
                    reason: other.to_string(),
                },
            });
        }
    }
    errors
}
