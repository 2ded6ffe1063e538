use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

/// Liveness reporting for the long-running tasks of the service.
///
/// The process hosts several asynchronous loops (message ingestion, cache
/// purging), and it can only be trusted with notifications if all of them
/// are actually making progress. Each loop registers a component and must
/// report healthy more often than its deadline; a component that stops
/// reporting is considered stalled and fails the probe.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set when a component is newly registered, before its first report.
    Starting,
    /// Recently reported healthy, must report again before the instant.
    HealthyUntil(DateTime<Utc>),
    /// Reported unhealthy by the component itself.
    Unhealthy,
    /// The HealthyUntil deadline has passed without a new report.
    Stalled,
}

/// Handed to a component so it can report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if every registered component reported healthy recently enough.
    pub healthy: bool,
    /// Last known status of each component, for the probe body.
    pub components: HashMap<String, ComponentStatus>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component and returns the handle it should report through.
    /// `deadline` is the maximum silence tolerated between healthy reports.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Computes the overall status from all registered components.
    /// Usable directly as an axum handler return value.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        // Unhealthy until at least one component has registered.
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        let now = Utc::now();

        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    status.healthy = false;
                    status.components.insert(name.clone(), component.clone());
                }
            }
        }

        if !status.healthy {
            warn!(
                "{} health check failed: {:?}",
                self.name, status.components
            );
        }
        status
    }
}

impl HealthHandle {
    /// Report healthy for another deadline period. Must be called more
    /// frequently than the deadline configured at registration.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            Utc::now() + self.deadline,
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            // Poisoned lock: just warn, the probe will fail and the
            // process restart.
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise, with the per-component breakdown
    /// in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("ingester", Duration::seconds(30));

        // Registered but not yet reporting: Starting, probe fails.
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("ingester"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);

        handle.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn stalled_component_fails_the_probe() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("purger", Duration::seconds(30));

        handle.report_status(ComponentStatus::HealthyUntil(
            Utc::now() - Duration::seconds(1),
        ));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("purger"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("one", Duration::seconds(30));
        let two = registry.register("two", Duration::seconds(30));

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);

        one.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn into_response_status_codes() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
