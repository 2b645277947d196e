//! Cross-service routing and health-check supervision.
//!
//! A small named-service directory: each registered service gets its own
//! queue and consumer, and the integrator periodically polls each one's
//! health and raises an event when its status changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{Ack, BrokerError, DeliveryHandler, MessageBroker};
use crate::config::MonitoringThresholds;

#[derive(Debug, Error)]
pub enum IntegratorError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("service '{0}' is not registered")]
    UnknownService(String),

    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Health state for a registered service, derived from consecutive
/// missed/failed health checks against [`MonitoringThresholds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// A callback invoked for inbound point-to-point messages addressed to a
/// registered service.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
/// A check run on a fixed interval to determine a service's liveness.
pub type HealthCheck = Arc<dyn Fn() -> futures::future::BoxFuture<'static, bool> + Send + Sync>;
/// Rewrites a message body before it's forwarded by a [`LogicalRoute`].
pub type RouteTransform = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;
/// Gates whether a [`LogicalRoute`] applies to a given message body.
pub type RouteCondition = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct RegisteredService {
    queue: String,
    health_check: Option<HealthCheck>,
    consecutive_failures: u32,
    health: ServiceHealth,
    consumer_task: Option<JoinHandle<()>>,
}

/// A named forwarding rule: messages whose source label matches
/// `source_pattern` (an AMQP topic pattern) are optionally filtered by
/// `condition`, optionally rewritten by `transform`, and republished to
/// `target_pattern` as the routing key. Disabled routes are kept registered
/// but skipped, so toggling one off doesn't lose its configuration.
#[derive(Clone)]
pub struct LogicalRoute {
    pub name: String,
    pub source_pattern: String,
    pub target_pattern: String,
    pub transform: Option<RouteTransform>,
    pub condition: Option<RouteCondition>,
    pub enabled: bool,
}

impl LogicalRoute {
    pub fn new(name: impl Into<String>, source_pattern: impl Into<String>, target_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_pattern: source_pattern.into(),
            target_pattern: target_pattern.into(),
            transform: None,
            condition: None,
            enabled: true,
        }
    }

    pub fn with_transform(mut self, transform: RouteTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_condition(mut self, condition: RouteCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Event raised when a service's computed [`ServiceHealth`] changes.
#[derive(Debug, Clone)]
pub struct HealthChanged {
    pub service: String,
    pub previous: ServiceHealth,
    pub current: ServiceHealth,
}

/// Registers per-service queues/consumers, routes point-to-point and
/// broadcast messages, and supervises service health.
pub struct ServiceIntegrator {
    broker: Arc<dyn MessageBroker>,
    services: Mutex<HashMap<String, RegisteredService>>,
    routes: Mutex<Vec<LogicalRoute>>,
    thresholds: MonitoringThresholds,
    health_events: broadcast::Sender<HealthChanged>,
}

impl ServiceIntegrator {
    pub fn new(broker: Arc<dyn MessageBroker>, thresholds: MonitoringThresholds) -> Arc<Self> {
        let (health_events, _) = broadcast::channel(64);
        Arc::new(Self {
            broker,
            services: Mutex::new(HashMap::new()),
            routes: Mutex::new(Vec::new()),
            thresholds,
            health_events,
        })
    }

    /// Register a logical route. Built-in routes (service discovery,
    /// health-check response) are added automatically by
    /// [`Self::with_builtin_routes`]; callers add their own on top.
    pub async fn add_route(&self, route: LogicalRoute) {
        self.routes.lock().await.push(route);
    }

    /// Install the built-in routes every integrator carries: a
    /// service-discovery response annotating the live registry, and a
    /// health-check response carrying each service's current status.
    pub async fn with_builtin_routes(self: Arc<Self>) -> Arc<Self> {
        let mut routes = self.routes.lock().await;
        routes.push(LogicalRoute::new(
            "service-discovery-response",
            "discovery.request",
            "discovery.response",
        ));
        routes.push(LogicalRoute::new(
            "health-check-response",
            "health.request",
            "health.response",
        ));
        drop(routes);
        self
    }

    /// Evaluate every enabled route against `source_label`, applying each
    /// match's condition/transform and republishing the (possibly rewritten)
    /// body under the route's target pattern on the service exchange.
    /// Returns the names of the routes that fired.
    pub async fn route_message(&self, source_label: &str, body: &[u8]) -> Result<Vec<String>, IntegratorError> {
        let routes = self.routes.lock().await.clone();
        let mut fired = Vec::new();
        for route in routes {
            if !route.enabled || !crate::broker::topic_pattern_matches(&route.source_pattern, source_label) {
                continue;
            }
            if let Some(condition) = &route.condition {
                if !condition(body) {
                    continue;
                }
            }
            let forwarded = match &route.transform {
                Some(transform) => transform(body.to_vec()),
                None => body.to_vec(),
            };
            self.broker
                .publish("", &route.target_pattern, &forwarded, crate::broker::PublishOptions::default())
                .await?;
            fired.push(route.name.clone());
        }
        Ok(fired)
    }

    /// Annotate a raised error with a severity derived from its message,
    /// per the built-in error-handling route: `ENGINE_FAILURE`/timeout-class
    /// codes are `high`, validation-class codes are `medium`, everything
    /// else `low`.
    pub fn annotate_error_severity(code: &str) -> &'static str {
        match code {
            c if c.contains("TIMEOUT") || c.contains("FAILURE") || c.contains("UNAVAILABLE") => "high",
            c if c.contains("VALIDATION") || c.contains("INVALID") => "medium",
            _ => "low",
        }
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthChanged> {
        self.health_events.subscribe()
    }

    /// Register a service, wiring its queue to `on_message` and an optional
    /// `health_check` the monitoring loop polls on
    /// `thresholds.health_check_interval`.
    pub async fn register_service(
        self: &Arc<Self>,
        name: &str,
        queue: &str,
        on_message: MessageHandler,
        health_check: Option<HealthCheck>,
    ) -> Result<(), IntegratorError> {
        {
            let services = self.services.lock().await;
            if services.contains_key(name) {
                return Err(IntegratorError::AlreadyRegistered(name.to_string()));
            }
        }

        let integrator = Arc::clone(self);
        let queue_owned = queue.to_string();
        let consumer_tag = format!("svc-{name}");
        let handler: DeliveryHandler = Arc::new(move |delivery| {
            let on_message = Arc::clone(&on_message);
            async move {
                on_message(delivery.body);
                Ack::Ack
            }
            .boxed()
        });
        let consumer_task = tokio::spawn(async move {
            if let Err(err) = integrator.broker.consume(&queue_owned, &consumer_tag, handler).await {
                warn!(error = %err, service = %consumer_tag, "service consumer ended");
            }
        });

        self.services.lock().await.insert(
            name.to_string(),
            RegisteredService {
                queue: queue.to_string(),
                health_check,
                consecutive_failures: 0,
                health: ServiceHealth::Unknown,
                consumer_task: Some(consumer_task),
            },
        );
        info!(service = name, queue, "service registered");
        Ok(())
    }

    pub async fn deregister_service(&self, name: &str) -> Result<(), IntegratorError> {
        let mut services = self.services.lock().await;
        let service = services
            .remove(name)
            .ok_or_else(|| IntegratorError::UnknownService(name.to_string()))?;
        if let Some(task) = service.consumer_task {
            task.abort();
        }
        Ok(())
    }

    /// Send a point-to-point message to a registered service's queue.
    pub async fn send_message(&self, name: &str, body: &[u8]) -> Result<(), IntegratorError> {
        let services = self.services.lock().await;
        let service = services
            .get(name)
            .ok_or_else(|| IntegratorError::UnknownService(name.to_string()))?;
        self.broker
            .publish("", &service.queue, body, crate::broker::PublishOptions::default())
            .await?;
        Ok(())
    }

    /// Send a point-to-point message and wait for a reply via RPC
    /// (temporary reply queue + correlation id, matching
    /// [`crate::broker::MessageBroker::publish_rpc`]).
    pub async fn send_message_rpc(
        &self,
        name: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, IntegratorError> {
        let queue = {
            let services = self.services.lock().await;
            services
                .get(name)
                .ok_or_else(|| IntegratorError::UnknownService(name.to_string()))?
                .queue
                .clone()
        };
        let reply = self.broker.publish_rpc("", &queue, body, timeout).await?;
        Ok(reply)
    }

    /// Broadcast a message to every registered service's queue except those
    /// named in `exclude`.
    pub async fn broadcast_message(&self, body: &[u8], exclude: &[&str]) -> Result<(), IntegratorError> {
        let services = self.services.lock().await;
        for (name, service) in services.iter() {
            if exclude.contains(&name.as_str()) {
                continue;
            }
            self.broker
                .publish("", &service.queue, body, crate::broker::PublishOptions::default())
                .await?;
        }
        Ok(())
    }

    pub async fn service_health(&self, name: &str) -> Result<ServiceHealth, IntegratorError> {
        self.services
            .lock()
            .await
            .get(name)
            .map(|s| s.health)
            .ok_or_else(|| IntegratorError::UnknownService(name.to_string()))
    }

    /// Run the health-check loop until cancelled. Intended to be spawned as
    /// its own task; polls every registered service's health check on
    /// `thresholds.health_check_interval` and raises [`HealthChanged`] when
    /// a service crosses the degraded/unhealthy thresholds.
    pub async fn run_health_checks(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(self.thresholds.health_check_interval);
        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }

    async fn poll_once(&self) {
        let names: Vec<String> = self.services.lock().await.keys().cloned().collect();
        for name in names {
            let health_check = {
                let services = self.services.lock().await;
                services.get(&name).and_then(|s| s.health_check.clone())
            };
            let Some(health_check) = health_check else {
                continue;
            };
            let healthy = health_check().await;

            let mut services = self.services.lock().await;
            let Some(service) = services.get_mut(&name) else {
                continue;
            };
            if healthy {
                service.consecutive_failures = 0;
            } else {
                service.consecutive_failures += 1;
            }

            let new_health = if service.consecutive_failures == 0 {
                ServiceHealth::Healthy
            } else if service.consecutive_failures >= self.thresholds.unhealthy_after_misses {
                ServiceHealth::Unhealthy
            } else if service.consecutive_failures >= self.thresholds.degraded_after_misses {
                ServiceHealth::Degraded
            } else {
                service.health
            };

            if new_health != service.health {
                let previous = service.health;
                service.health = new_health;
                let _ = self.health_events.send(HealthChanged {
                    service: name.clone(),
                    previous,
                    current: new_health,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;

    fn fast_thresholds() -> MonitoringThresholds {
        MonitoringThresholds {
            health_check_interval: Duration::from_millis(10),
            degraded_after_misses: 1,
            unhealthy_after_misses: 2,
        }
    }

    #[tokio::test]
    async fn register_then_register_again_errors() {
        let broker = MockBroker::new();
        let integrator = ServiceIntegrator::new(broker, fast_thresholds());
        integrator
            .register_service("proj", "proj.queue", Arc::new(|_| {}), None)
            .await
            .unwrap();
        let err = integrator
            .register_service("proj", "proj.queue", Arc::new(|_| {}), None)
            .await;
        assert!(matches!(err, Err(IntegratorError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn send_message_to_unknown_service_errors() {
        let broker = MockBroker::new();
        let integrator = ServiceIntegrator::new(broker, fast_thresholds());
        let err = integrator.send_message("ghost", b"hi").await;
        assert!(matches!(err, Err(IntegratorError::UnknownService(_))));
    }

    #[tokio::test]
    async fn failing_health_check_marks_service_unhealthy() {
        let broker = MockBroker::new();
        let integrator = ServiceIntegrator::new(broker, fast_thresholds());
        integrator
            .register_service(
                "worker",
                "worker.queue",
                Arc::new(|_| {}),
                Some(Arc::new(|| async { false }.boxed())),
            )
            .await
            .unwrap();

        integrator.poll_once().await;
        assert_eq!(integrator.service_health("worker").await.unwrap(), ServiceHealth::Degraded);
        integrator.poll_once().await;
        assert_eq!(integrator.service_health("worker").await.unwrap(), ServiceHealth::Unhealthy);
    }

    #[tokio::test]
    async fn recovering_health_check_clears_degraded_state() {
        let broker = MockBroker::new();
        let integrator = ServiceIntegrator::new(broker, fast_thresholds());
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let healthy_clone = Arc::clone(&healthy);
        integrator
            .register_service(
                "worker",
                "worker.queue",
                Arc::new(|_| {}),
                Some(Arc::new(move || {
                    let healthy = Arc::clone(&healthy_clone);
                    async move { healthy.load(std::sync::atomic::Ordering::SeqCst) }.boxed()
                })),
            )
            .await
            .unwrap();

        integrator.poll_once().await;
        assert_eq!(integrator.service_health("worker").await.unwrap(), ServiceHealth::Degraded);

        healthy.store(true, std::sync::atomic::Ordering::SeqCst);
        integrator.poll_once().await;
        assert_eq!(integrator.service_health("worker").await.unwrap(), ServiceHealth::Healthy);
    }

    #[tokio::test]
    async fn broadcast_message_skips_excluded_service() {
        let broker = MockBroker::new();
        let integrator = ServiceIntegrator::new(broker.clone(), fast_thresholds());
        integrator
            .register_service("a", "a.queue", Arc::new(|_| {}), None)
            .await
            .unwrap();
        integrator
            .register_service("b", "b.queue", Arc::new(|_| {}), None)
            .await
            .unwrap();

        integrator.broadcast_message(b"hi", &["b"]).await.unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
    }

    #[tokio::test]
    async fn route_message_forwards_transformed_body_on_match() {
        let broker = MockBroker::new();
        let integrator = ServiceIntegrator::new(broker.clone(), fast_thresholds());
        integrator
            .add_route(
                LogicalRoute::new("uppercase", "raw.*", "annotated.event")
                    .with_transform(Arc::new(|body| body.to_ascii_uppercase())),
            )
            .await;

        let fired = integrator.route_message("raw.created", b"hi").await.unwrap();
        assert_eq!(fired, vec!["uppercase".to_string()]);

        let published = broker.published().await;
        assert_eq!(published[0].routing_key, "annotated.event");
        assert_eq!(published[0].body, b"HI");
    }

    #[tokio::test]
    async fn route_message_skips_disabled_and_non_matching_routes() {
        let broker = MockBroker::new();
        let integrator = ServiceIntegrator::new(broker.clone(), fast_thresholds());
        integrator
            .add_route(LogicalRoute::new("disabled", "raw.*", "x").disabled())
            .await;
        integrator
            .add_route(LogicalRoute::new("wrong-source", "other.*", "y"))
            .await;

        let fired = integrator.route_message("raw.created", b"hi").await.unwrap();
        assert!(fired.is_empty());
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn builtin_routes_cover_discovery_and_health() {
        let broker = MockBroker::new();
        let integrator = ServiceIntegrator::new(broker, fast_thresholds()).with_builtin_routes().await;
        let fired = integrator.route_message("discovery.request", b"{}").await.unwrap();
        assert_eq!(fired, vec!["service-discovery-response".to_string()]);
    }

    #[test]
    fn error_severity_annotation_matches_builtin_classes() {
        assert_eq!(ServiceIntegrator::annotate_error_severity("ENGINE_TIMEOUT"), "high");
        assert_eq!(ServiceIntegrator::annotate_error_severity("VALIDATION_ERROR"), "medium");
        assert_eq!(ServiceIntegrator::annotate_error_severity("UNKNOWN"), "low");
    }

    #[tokio::test]
    async fn send_message_rpc_returns_stubbed_reply() {
        let broker = MockBroker::new();
        broker.stub_rpc_response("svc.queue", b"pong".to_vec()).await;
        let integrator = ServiceIntegrator::new(broker, fast_thresholds());
        integrator
            .register_service("svc", "svc.queue", Arc::new(|_| {}), None)
            .await
            .unwrap();

        let reply = integrator
            .send_message_rpc("svc", b"ping", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"pong");
    }
}
