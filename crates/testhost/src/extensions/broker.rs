//! Fan-out of data messages to enabled data consumers.
//!
//! Each consumer owns a bounded queue drained by its own task, so a slow
//! consumer only falls behind on its own queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::host::{ActiveExtensions, contain};
use crate::bridge::protocol::HANDSHAKE_TYPE;
use crate::bridge::registry::{Message, MessageKind, MessageTypeId, SerializerRegistry};
use crate::dispatcher::RequestHandler;

/// Messages buffered per consumer before publishers wait.
pub const CONSUMER_QUEUE_DEPTH: usize = 256;

type Routes = HashMap<MessageTypeId, Vec<mpsc::Sender<Message>>>;

pub struct DataConsumerBroker {
    routes: Mutex<Option<Routes>>,
    data_types: Vec<MessageTypeId>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DataConsumerBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConsumerBroker")
            .field("data_types", &self.data_types)
            .finish()
    }
}

impl DataConsumerBroker {
    /// Spawn one consumer task per enabled data consumer.
    ///
    /// Subscriptions to types `registry` cannot route as requests are logged
    /// and dropped; a consumer left with none is not attached.
    pub fn new(active: &ActiveExtensions, registry: &SerializerRegistry) -> Self {
        let mut routes: Routes = HashMap::new();
        let mut tasks = Vec::new();

        for (extension, consumer) in active.data_consumers() {
            let mut types = consumer.data_types();
            types.retain(|type_id| match routable(registry, *type_id) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::warn!(
                        extension = %extension.info.id,
                        type_id,
                        %reason,
                        "Ignoring data consumer subscription"
                    );
                    false
                }
            });
            types.sort_unstable();
            types.dedup();
            if types.is_empty() {
                continue;
            }
            let (tx, mut rx) = mpsc::channel::<Message>(CONSUMER_QUEUE_DEPTH);
            for type_id in &types {
                routes.entry(*type_id).or_default().push(tx.clone());
            }
            tracing::debug!(extension = %extension.info.id, ?types, "Data consumer attached");

            let extension = extension.clone();
            tasks.push(tokio::spawn(async move {
                let Some(consumer) = extension.instance.as_data_consumer() else {
                    return;
                };
                while let Some(message) = rx.recv().await {
                    contain(&extension.info, "consume", consumer.consume(message)).await;
                }
            }));
        }

        let mut data_types: Vec<_> = routes.keys().copied().collect();
        data_types.sort_unstable();
        Self {
            routes: Mutex::new(Some(routes)),
            data_types,
            tasks: Mutex::new(tasks),
        }
    }

    /// Message types at least one consumer subscribed to.
    pub fn data_types(&self) -> &[MessageTypeId] {
        &self.data_types
    }

    fn senders(&self, type_id: MessageTypeId) -> Vec<mpsc::Sender<Message>> {
        let routes = match self.routes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        routes
            .as_ref()
            .and_then(|r| r.get(&type_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Hand `message` to every subscribed consumer. Returns how many accepted it.
    pub async fn publish(&self, message: Message) -> usize {
        let senders = self.senders(message.type_id());
        let sends = senders.iter().map(|tx| tx.send(message.clone()));
        futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count()
    }

    /// Stop accepting messages and wait for every consumer to drain its queue.
    pub async fn shutdown(&self) {
        let routes = match self.routes.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(routes);
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Data consumer task failed");
            }
        }
    }
}

fn routable(registry: &SerializerRegistry, type_id: MessageTypeId) -> Result<(), String> {
    let shape = registry.resolve(type_id).map_err(|e| e.to_string())?;
    if shape.kind != MessageKind::Request || type_id == HANDSHAKE_TYPE {
        return Err(format!("{} is not a routable request type", shape.name));
    }
    Ok(())
}

#[async_trait]
impl RequestHandler for DataConsumerBroker {
    async fn handle(&self, request: Message) -> anyhow::Result<Option<Message>> {
        let delivered = self.publish(request).await;
        tracing::trace!(delivered, "Published data message");
        Ok(None)
    }
}
