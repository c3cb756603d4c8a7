// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Health check support.
//!
//! Serves `/healthz` (liveness), `/healthz/ready` and `/healthz/deep`.
//! Readiness means every registered checker passed; the lease tracker
//! checker passes when the lease document can be read.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::http::StatusCode as HttpStatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::store::{DocumentStore, LeaseStoreClient};

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub checks: HashMap<String, HealthStatus>,
}

/// Health checker trait.
pub trait HealthChecker: Send + Sync + 'static {
    /// Performs a health check. Returns `true` if the component is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Checks that the lease document is reachable. Only reads; a missing
/// document is healthy.
pub struct LeaseStoreChecker<S> {
    client: LeaseStoreClient<S>,
}

impl<S: DocumentStore> LeaseStoreChecker<S> {
    /// Creates a checker reading through `client`.
    pub fn new(client: LeaseStoreClient<S>) -> Self {
        Self { client }
    }
}

impl<S: DocumentStore> HealthChecker for LeaseStoreChecker<S> {
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self.client.fetch().await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "lease tracker health check failed");
                    false
                }
            }
        })
    }

    fn name(&self) -> &str {
        "lease-tracker"
    }
}

/// Health check registry.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Runs all health checks and returns the results.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = HashMap::new();
        let mut overall_healthy = true;

        for checker in checkers.iter() {
            let healthy = checker.check().await;
            overall_healthy &= healthy;
            checks.insert(
                checker.name().to_string(),
                if healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                },
            );
        }

        HealthCheck {
            status: if overall_healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            checks,
        }
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// Health check server.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a new health server.
    pub fn new(bind_address: String, bind_port: u16) -> Self {
        Self {
            registry: HealthRegistry::new(),
            bind_address,
            bind_port,
        }
    }

    /// Returns the health registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Serves health checks until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("health server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("health server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    handle_request(req.uri().path().to_string(), registry.clone())
                });

                if let Err(e) = http.serve_connection(io, service).await {
                    tracing::debug!(error = %e, "health connection closed with error");
                }
            });
        }
    }
}

fn response(status: HttpStatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handle incoming HTTP requests.
async fn handle_request(
    path: String,
    registry: HealthRegistry,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match path.as_str() {
        "/healthz" | "/healthz/live" => response(HttpStatusCode::OK, "text/plain", "ok".to_string()),
        "/healthz/ready" => {
            let result = registry.check_all().await;
            if result.status == HealthStatus::Healthy {
                response(HttpStatusCode::OK, "text/plain", "ok".to_string())
            } else {
                response(HttpStatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready".to_string())
            }
        }
        "/healthz/deep" => {
            let result = registry.check_all().await;
            let status = if result.status == HealthStatus::Healthy {
                HttpStatusCode::OK
            } else {
                HttpStatusCode::SERVICE_UNAVAILABLE
            };
            let json = serde_json::to_string(&result).unwrap_or_default();
            response(status, "application/json", json)
        }
        _ => response(HttpStatusCode::NOT_FOUND, "text/plain", "not found".to_string()),
    };

    Ok(response)
}
