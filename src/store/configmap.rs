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

//! ConfigMap-backed lease document.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;

use super::{CreateOutcome, Document, DocumentStore, DocumentVersion, WriteOutcome};
use crate::error::StoreError;

/// Field manager recorded on writes to the tracker ConfigMap.
pub const FIELD_MANAGER: &str = "static-ip";

/// Stores the lease set in the `data` of one ConfigMap.
///
/// Writes are conditional on the `resourceVersion` observed at read time,
/// so the apiserver rejects a write based on a stale read with 409. Only
/// `data` is owned by the store; labels, annotations, owner references and
/// `binaryData` set by others are sent back unchanged.
#[derive(Clone)]
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapStore {
    /// Creates a store for ConfigMap `namespace/name`.
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name: name.into(),
        }
    }

    fn config_map(&self, data: BTreeMap<String, String>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            immutable: Some(false),
            ..Default::default()
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn to_document(&self, cm: ConfigMap) -> Result<Document, StoreError> {
        let version = cm.metadata.resource_version.ok_or_else(|| {
            StoreError::Rejected(format!(
                "configmap {} has no resourceVersion",
                self.location()
            ))
        })?;
        Ok(Document {
            data: cm.data.unwrap_or_default(),
            version: DocumentVersion::new(version),
        })
    }
}

/// Returns the HTTP status code of an apiserver error response.
fn api_status(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

#[async_trait]
impl DocumentStore for ConfigMapStore {
    fn location(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<Document>, StoreError> {
        match self.api.get_opt(&self.name).await? {
            Some(cm) => self.to_document(cm).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, data: BTreeMap<String, String>) -> Result<CreateOutcome, StoreError> {
        let cm = self.config_map(data);
        match self.api.create(&Self::post_params(), &cm).await {
            Ok(created) => Ok(CreateOutcome::Created(self.to_document(created)?)),
            Err(e) if api_status(&e) == Some(409) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(
        &self,
        data: BTreeMap<String, String>,
        version: &DocumentVersion,
    ) -> Result<WriteOutcome, StoreError> {
        let Some(mut cm) = self.api.get_opt(&self.name).await? else {
            return Ok(WriteOutcome::Conflict);
        };
        if cm.metadata.resource_version.as_deref() != Some(version.as_str()) {
            return Ok(WriteOutcome::Conflict);
        }
        cm.data = Some(data);

        match self.api.replace(&self.name, &Self::post_params(), &cm).await {
            Ok(updated) => Ok(WriteOutcome::Written(self.to_document(updated)?.version)),
            // 409: stale resourceVersion. 404: deleted since the read; the
            // next read recreates it.
            Err(e) if matches!(api_status(&e), Some(409) | Some(404)) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use super::*;
    use http::{Method, Request, Response};
    use http_body_util::BodyExt;
    use kube::client::Body;
    use kube::core::ErrorResponse;
    use serde_json::{json, Value};

    fn tracker(version: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "tracker",
                "namespace": "kube-system",
                "resourceVersion": version,
                "labels": {"team": "net"},
                "annotations": {"owner": "ops"},
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": "provider",
                    "uid": "0a1b2c3d"
                }]
            },
            "binaryData": {"blob": "AAE="},
            "data": {}
        })
    }

    /// Store backed by a fake apiserver that serves the tracker at version 7
    /// and records every PUT body.
    fn fake_store(puts: Arc<Mutex<Vec<Value>>>) -> ConfigMapStore {
        let service = tower::service_fn(move |req: Request<Body>| {
            let puts = puts.clone();
            async move {
                let method = req.method().clone();
                let body = req.into_body().collect().await.unwrap().to_bytes();
                let reply = if method == Method::PUT {
                    let mut sent: Value = serde_json::from_slice(&body).unwrap();
                    puts.lock().unwrap().push(sent.clone());
                    sent["metadata"]["resourceVersion"] = json!("8");
                    sent
                } else {
                    tracker("7")
                };
                let response = Response::builder()
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&reply).unwrap()))
                    .unwrap();
                Ok::<_, Infallible>(response)
            }
        });
        ConfigMapStore::new(Client::new(service, "kube-system"), "kube-system", "tracker")
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_api_status() {
        assert_eq!(api_status(&api_error(409)), Some(409));
        assert_eq!(api_status(&api_error(404)), Some(404));
    }

    #[tokio::test]
    async fn test_replace_keeps_metadata() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let store = fake_store(puts.clone());

        let data = BTreeMap::from([("ns_a".to_string(), "{}".to_string())]);
        let outcome = store.replace(data, &DocumentVersion::new("7")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written(DocumentVersion::new("8")));

        let puts = puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        let sent = &puts[0];
        assert_eq!(sent["metadata"]["resourceVersion"], "7");
        assert_eq!(sent["metadata"]["labels"]["team"], "net");
        assert_eq!(sent["metadata"]["annotations"]["owner"], "ops");
        assert_eq!(sent["metadata"]["ownerReferences"][0]["name"], "provider");
        assert_eq!(sent["binaryData"]["blob"], "AAE=");
        assert_eq!(sent["data"]["ns_a"], "{}");
    }

    #[tokio::test]
    async fn test_replace_at_stale_version_does_not_write() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let store = fake_store(puts.clone());

        let outcome = store
            .replace(BTreeMap::new(), &DocumentVersion::new("6"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert!(puts.lock().unwrap().is_empty());
    }
}
