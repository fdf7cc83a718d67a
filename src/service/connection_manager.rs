//! Connection manager: a named pool of broker connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};

use super::live_dataset::{DataSetSink, LiveDataSet};
use crate::config::{ConnectionConfig, ConnectionOptions};
use crate::domain::{
    ConnectionEvent, ConnectionSnapshot, ConnectionStatus, EventBus, Observers, SubscriptionId,
};
use crate::error::LinkError;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::ws::{
    Connection, ConnectionDeps, Connector, MessageCallback, SubscribeOptions, WebSocketConnector,
};

/// Aggregate figures across every managed connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatistics {
    /// Registered connections.
    pub total_connections: usize,
    /// Connections currently `connected`.
    pub active_connections: usize,
    /// Subscriptions across all connections.
    pub total_subscriptions: usize,
    /// Sum of `messages_sent`.
    pub messages_sent: u64,
    /// Sum of `messages_received`.
    pub messages_received: u64,
    /// Sum of `reconnect_count`.
    pub reconnect_count: u64,
    /// Sum of `error_count`.
    pub error_count: u64,
    /// Sum of `parse_errors`.
    pub parse_errors: u64,
    /// Per-connection snapshots, ordered by id.
    pub connections: Vec<ConnectionSnapshot>,
}

/// Named pool of [`Connection`]s.
///
/// Every mutation follows the same pattern: look up the connection under
/// the map lock, release the lock, delegate to the connection, and emit
/// manager-level events on the [`EventBus`]. Connection-level events reach
/// the same bus because the bus is injected into every connection as an
/// observer.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Connection>>,
    event_bus: EventBus,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
}

impl ConnectionManager {
    /// Creates a manager that dials brokers over WebSocket.
    #[must_use]
    pub fn new(event_bus: EventBus) -> Self {
        Self::with_connector(event_bus, Arc::new(WebSocketConnector))
    }

    /// Creates a manager that dials through `connector`.
    #[must_use]
    pub fn with_connector(event_bus: EventBus, connector: Arc<dyn Connector>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            event_bus,
            connector,
            scheduler: Arc::new(TokioScheduler),
        }
    }

    /// Replaces the scheduler given to connections created afterwards.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Returns the event bus.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Subscribes to manager and connection events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_bus.subscribe()
    }

    /// Registers a new connection. It starts disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::DuplicateConnection`] if `id` is taken.
    pub async fn create_connection(
        &self,
        id: &str,
        name: &str,
        config: ConnectionConfig,
        options: &ConnectionOptions,
    ) -> Result<Connection, LinkError> {
        let mut map = self.connections.write().await;
        if map.contains_key(id) {
            return Err(LinkError::DuplicateConnection(id.to_string()));
        }

        let config = config.merge_options(options);
        let url = config.url.clone();
        let observers = Observers::new().with(Arc::new(self.event_bus.clone()));
        let deps = ConnectionDeps::new(Arc::clone(&self.connector))
            .with_scheduler(Arc::clone(&self.scheduler))
            .with_observers(observers);
        let connection = Connection::spawn(id, name, config, deps);
        map.insert(id.to_string(), connection.clone());
        drop(map);

        let _ = self.event_bus.publish(ConnectionEvent::ConnectionCreated {
            connection_id: id.to_string(),
            name: name.to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!(connection_id = id, name, url = %url, "connection created");
        Ok(connection)
    }

    /// Connects `id`. A no-op when already connected.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionNotFound`] for unknown ids, or the
    /// connection failure.
    pub async fn connect(&self, id: &str) -> Result<(), LinkError> {
        let connection = self.connection(id).await?;
        if connection.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        connection.connect().await
    }

    /// Disconnects `id`, cancelling any pending reconnect. A no-op when
    /// already idle.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionNotFound`] for unknown ids.
    pub async fn disconnect(&self, id: &str) -> Result<(), LinkError> {
        let connection = self.connection(id).await?;
        if connection.snapshot().is_idle() {
            return Ok(());
        }
        connection.disconnect().await
    }

    /// Disconnects and forgets `id`. Its subscriptions and observers go
    /// with it.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionNotFound`] for unknown ids.
    pub async fn remove_connection(&self, id: &str) -> Result<(), LinkError> {
        let connection = self
            .connections
            .write()
            .await
            .remove(id)
            .ok_or_else(|| LinkError::ConnectionNotFound(id.to_string()))?;

        if let Err(err) = connection.shutdown().await {
            tracing::warn!(connection_id = id, error = %err, "connection task already stopped");
        }
        let _ = self.event_bus.publish(ConnectionEvent::ConnectionRemoved {
            connection_id: id.to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!(connection_id = id, "connection removed");
        Ok(())
    }

    /// Subscribes `callback` to `topic` on connection `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionNotFound`] for unknown ids and
    /// [`LinkError::NotConnected`] unless the connection is connected.
    pub async fn subscribe(
        &self,
        id: &str,
        topic: &str,
        callback: MessageCallback,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, LinkError> {
        let connection = self.connected(id).await?;
        connection.subscribe(topic, callback, options).await
    }

    /// Removes a subscription. No callback runs for it once this returns.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionNotFound`] or
    /// [`LinkError::SubscriptionNotFound`].
    pub async fn unsubscribe(
        &self,
        id: &str,
        subscription_id: SubscriptionId,
    ) -> Result<(), LinkError> {
        self.connection(id).await?.unsubscribe(subscription_id).await
    }

    /// Publishes `data` to `topic` on connection `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionNotFound`], [`LinkError::NotConnected`]
    /// or [`LinkError::Serialization`].
    pub async fn publish(
        &self,
        id: &str,
        topic: &str,
        data: &Value,
        headers: BTreeMap<String, String>,
    ) -> Result<(), LinkError> {
        self.connection(id).await?.publish(topic, data, headers).await
    }

    /// Subscribes to `topic` and mirrors its change events into a
    /// [`LiveDataSet`] keyed by `key_field`.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionManager::subscribe`].
    pub async fn subscribe_dataset(
        &self,
        id: &str,
        topic: &str,
        key_field: &str,
        throttle: Option<Duration>,
    ) -> Result<LiveDataSet, LinkError> {
        let sink = DataSetSink::new(key_field);
        let options = SubscribeOptions {
            throttle: throttle.filter(|t| !t.is_zero()),
            ..SubscribeOptions::default()
        };
        let subscription_id = self.subscribe(id, topic, sink.callback(), options).await?;
        tracing::info!(connection_id = id, topic, key_field, "dataset subscribed");
        Ok(sink.dataset(id, topic, subscription_id))
    }

    /// Returns aggregate statistics.
    pub async fn get_statistics(&self) -> ManagerStatistics {
        let mut connections: Vec<ConnectionSnapshot> = self
            .connections
            .read()
            .await
            .values()
            .map(Connection::snapshot)
            .collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));

        let mut stats = ManagerStatistics {
            total_connections: connections.len(),
            active_connections: 0,
            total_subscriptions: 0,
            messages_sent: 0,
            messages_received: 0,
            reconnect_count: 0,
            error_count: 0,
            parse_errors: 0,
            connections: Vec::new(),
        };
        for snap in &connections {
            if snap.status == ConnectionStatus::Connected {
                stats.active_connections += 1;
            }
            stats.total_subscriptions += snap.subscription_count;
            stats.messages_sent += snap.metrics.messages_sent;
            stats.messages_received += snap.metrics.messages_received;
            stats.reconnect_count += snap.metrics.reconnect_count;
            stats.error_count += snap.metrics.error_count;
            stats.parse_errors += snap.metrics.parse_errors;
        }
        stats.connections = connections;
        stats
    }

    /// Returns the connection registered as `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionNotFound`] for unknown ids.
    pub async fn connection(&self, id: &str) -> Result<Connection, LinkError> {
        self.connections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LinkError::ConnectionNotFound(id.to_string()))
    }

    /// Returns every registered id, sorted.
    pub async fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Removes every connection.
    pub async fn shutdown(&self) {
        for id in self.connection_ids().await {
            if let Err(err) = self.remove_connection(&id).await {
                tracing::debug!(connection_id = %id, error = %err, "already removed");
            }
        }
    }

    async fn connected(&self, id: &str) -> Result<Connection, LinkError> {
        let connection = self.connection(id).await?;
        if connection.status() != ConnectionStatus::Connected {
            return Err(LinkError::NotConnected {
                connection_id: id.to_string(),
            });
        }
        Ok(connection)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::domain::{DataSourceEvent, row_from_value};
    use crate::ws::frame::Command;
    use crate::ws::mock::{MockConnector, MockServer};

    fn config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("ws://broker.test/ws");
        config.heartbeat_incoming = Duration::ZERO;
        config.heartbeat_outgoing = Duration::ZERO;
        config
    }

    fn manager() -> (ConnectionManager, Arc<MockConnector>, UnboundedReceiver<MockServer>) {
        let (connector, servers) = MockConnector::new();
        let manager = ConnectionManager::with_connector(
            EventBus::new(256),
            Arc::clone(&connector) as Arc<dyn Connector>,
        );
        (manager, connector, servers)
    }

    async fn connect(
        manager: &Arc<ConnectionManager>,
        servers: &mut UnboundedReceiver<MockServer>,
        id: &str,
    ) -> MockServer {
        let mgr = Arc::clone(manager);
        let target = id.to_string();
        let pending = tokio::spawn(async move { mgr.connect(&target).await });
        let Some(mut server) = servers.recv().await else {
            panic!("no dial");
        };
        server.accept().await;
        let Ok(Ok(())) = pending.await else {
            panic!("connect failed");
        };
        server
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_emits_created() {
        let (manager, _connector, _servers) = manager();
        let mut events = manager.events();
        let created = manager
            .create_connection("c1", "Prices", config(), &ConnectionOptions::default())
            .await;
        let Ok(connection) = created else {
            panic!("create failed");
        };
        assert_eq!(connection.id(), "c1");
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);

        let dup = manager
            .create_connection("c1", "Again", config(), &ConnectionOptions::default())
            .await;
        assert!(matches!(dup, Err(LinkError::DuplicateConnection(id)) if id == "c1"));

        let Ok(ConnectionEvent::ConnectionCreated { connection_id, name, .. }) = events.recv().await
        else {
            panic!("expected ConnectionCreated");
        };
        assert_eq!((connection_id.as_str(), name.as_str()), ("c1", "Prices"));
        assert_eq!(manager.connection_ids().await, vec!["c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn per_connection_options_override_config() {
        let (manager, connector, mut servers) = manager();
        let manager = Arc::new(manager);
        let options = ConnectionOptions {
            auto_reconnect: Some(false),
            ..ConnectionOptions::default()
        };
        let Ok(connection) = manager.create_connection("c1", "x", config(), &options).await else {
            panic!("create failed");
        };
        let server = connect(&manager, &mut servers, "c1").await;

        let mut watch = connection.watch();
        server.drop_connection("reset by peer");
        let Ok(_) = watch.wait_for(|s| s.status == ConnectionStatus::Error).await else {
            panic!("task stopped");
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.dial_count(), 1);
        assert!(!connection.snapshot().reconnect_pending);
        assert!(matches!(
            manager.connection("missing").await,
            Err(LinkError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_require_a_connected_connection() {
        let (manager, connector, _servers) = manager();
        let Ok(_) = manager
            .create_connection("c1", "x", config(), &ConnectionOptions::default())
            .await
        else {
            panic!("create failed");
        };

        let callback: MessageCallback = Arc::new(|_| {});
        let sub = manager
            .subscribe("c1", "/topic/a", callback, SubscribeOptions::default())
            .await;
        assert!(matches!(sub, Err(LinkError::NotConnected { .. })));

        let published = manager
            .publish("c1", "/topic/a", &json!({"x": 1}), BTreeMap::new())
            .await;
        assert!(matches!(published, Err(LinkError::NotConnected { .. })));
        assert_eq!(connector.dial_count(), 0);

        assert!(matches!(
            manager.subscribe_dataset("nope", "/topic/a", "id", None).await,
            Err(LinkError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn prices_topic_reconciles_end_to_end() {
        let (manager, _connector, mut servers) = manager();
        let manager = Arc::new(manager);
        let Ok(_) = manager
            .create_connection("c1", "Prices", config(), &ConnectionOptions::default())
            .await
        else {
            panic!("create failed");
        };
        let mut server = connect(&manager, &mut servers, "c1").await;

        let Ok(dataset) = manager
            .subscribe_dataset("c1", "/topic/prices", "id", None)
            .await
        else {
            panic!("subscribe failed");
        };
        let frame = server.expect(Command::Subscribe).await;
        assert_eq!(frame.get("destination"), Some("/topic/prices"));

        let sub = dataset.subscription_id().to_string();
        for body in [
            r#"{"type":"snapshot","timestamp":"t1","data":[{"id":"A","price":10}]}"#,
            r#"{"type":"update","timestamp":"t2","key":"A","data":{"price":11}}"#,
            r#"{"type":"insert","timestamp":"t3","data":{"id":"B","price":5}}"#,
            r#"{"type":"delete","timestamp":"t4","key":"A"}"#,
        ] {
            server.message(&sub, "/topic/prices", body);
        }

        let mut changes = dataset.changes();
        let Ok(_) = changes.wait_for(|v| *v == 4).await else {
            panic!("dataset closed");
        };
        let Some(expected) = row_from_value(json!({"id": "B", "price": 5})) else {
            panic!("bad row");
        };
        assert_eq!(dataset.rows(), vec![expected]);

        let stats = manager.get_statistics().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_subscriptions, 1);
        assert_eq!(stats.messages_received, 4);
        assert_eq!(stats.connections.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_and_disconnect_are_idempotent() {
        let (manager, connector, mut servers) = manager();
        let manager = Arc::new(manager);
        let Ok(_) = manager
            .create_connection("c1", "x", config(), &ConnectionOptions::default())
            .await
        else {
            panic!("create failed");
        };
        tokio_test::assert_ok!(manager.disconnect("c1").await);

        let mut server = connect(&manager, &mut servers, "c1").await;
        tokio_test::assert_ok!(manager.connect("c1").await);
        assert_eq!(connector.dial_count(), 1);

        tokio_test::assert_ok!(manager.disconnect("c1").await);
        server.expect(Command::Disconnect).await;
        tokio_test::assert_ok!(manager.disconnect("c1").await);
        let Ok(connection) = manager.connection("c1").await else {
            panic!("connection missing");
        };
        assert!(connection.snapshot().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_disconnects_and_emits_removed() {
        let (manager, _connector, mut servers) = manager();
        let manager = Arc::new(manager);
        let mut events = manager.events();
        let Ok(connection) = manager
            .create_connection("c1", "x", config(), &ConnectionOptions::default())
            .await
        else {
            panic!("create failed");
        };
        let mut server = connect(&manager, &mut servers, "c1").await;
        let callback: MessageCallback = Arc::new(|_| {});
        let Ok(_) = manager
            .subscribe("c1", "/topic/a", callback, SubscribeOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };
        server.expect(Command::Subscribe).await;

        tokio_test::assert_ok!(manager.remove_connection("c1").await);
        server.expect(Command::Unsubscribe).await;
        server.expect(Command::Disconnect).await;
        assert!(server.closed().await);

        assert!(manager.connection_ids().await.is_empty());
        assert!(matches!(
            manager.remove_connection("c1").await,
            Err(LinkError::ConnectionNotFound(_))
        ));
        assert!(matches!(
            connection.connect().await,
            Err(LinkError::Internal(_))
        ));

        let seen = drain(&mut events);
        let kinds: Vec<&str> = seen.iter().map(ConnectionEvent::event_type_str).collect();
        assert_eq!(kinds.first(), Some(&"connection_created"));
        assert_eq!(kinds.last(), Some(&"connection_removed"));
        assert!(seen.iter().any(|e| matches!(
            e,
            ConnectionEvent::DataSource {
                event: DataSourceEvent::SubscriptionAdded { .. },
                ..
            }
        )));
        assert!(seen.iter().all(|e| e.connection_id() == "c1"));
    }
}
