//! Kubernetes-backed resource client

use crate::client::{ClientResource, DeleteOpts, ResourceClient, StatusClient, WriteOpts};
use crate::{CoreError, Result};
use async_trait::async_trait;
use edge_api::{HasStatus, Status};
use futures::stream::{BoxStream, StreamExt};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::marker::PhantomData;
use tracing::{debug, warn};

pub struct KubeResourceClient<K> {
    client: Client,
    kind: String,
    _marker: PhantomData<fn() -> K>,
}

impl<K: ClientResource> KubeResourceClient<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kind: K::kind(&()).to_string(),
            _marker: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn map_err(&self, err: kube::Error, namespace: &str, name: &str) -> CoreError {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => {
                CoreError::not_found(&self.kind, namespace, name)
            }
            kube::Error::Api(resp) if resp.code == 409 => CoreError::ResourceVersionConflict {
                kind: self.kind.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                expected: String::new(),
                found: resp.message,
            },
            other => CoreError::KubernetesError(other),
        }
    }
}

impl<K> Clone for KubeResourceClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            kind: self.kind.clone(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K: ClientResource> ResourceClient<K> for KubeResourceClient<K> {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<K> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| self.map_err(e, namespace, name))
    }

    async fn write(&self, mut resource: K, opts: WriteOpts) -> Result<K> {
        let namespace = resource.namespace().ok_or_else(|| {
            CoreError::InvalidConfiguration(format!(
                "{} {} has no namespace",
                self.kind,
                resource.name_any()
            ))
        })?;
        let name = resource.name_any();
        let api = self.api(&namespace);

        let existing = api
            .get_opt(&name)
            .await
            .map_err(|e| self.map_err(e, &namespace, &name))?;

        let written = match existing {
            Some(existing) => {
                if resource.resource_version().is_none() {
                    if !opts.overwrite_existing {
                        return Err(CoreError::AlreadyExists {
                            kind: self.kind.clone(),
                            namespace,
                            name,
                        });
                    }
                    resource.meta_mut().resource_version = existing.resource_version();
                }
                api.replace(&name, &PostParams::default(), &resource).await
            }
            None => {
                resource.meta_mut().resource_version = None;
                api.create(&PostParams::default(), &resource).await
            }
        };

        debug!(kind = %self.kind, namespace = %namespace, name = %name, "wrote resource");
        written.map_err(|e| self.map_err(e, &namespace, &name))
    }

    async fn delete(&self, namespace: &str, name: &str, opts: DeleteOpts) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match self.map_err(e, namespace, name) {
                CoreError::NotFound { .. } if opts.ignore_not_exist => Ok(()),
                err => Err(err),
            },
        }
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut items = api.list(&ListParams::default()).await?.items;
        items.sort_by(|a, b| {
            (a.namespace(), a.name_any()).cmp(&(b.namespace(), b.name_any()))
        });
        Ok(items)
    }

    fn subscribe(&self) -> BoxStream<'static, ()> {
        let api: Api<K> = Api::all(self.client.clone());
        let kind = self.kind.clone();
        watcher(api, watcher::Config::default())
            .filter_map(move |event| {
                let kind = kind.clone();
                async move {
                    match event {
                        Ok(watcher::Event::Apply(_))
                        | Ok(watcher::Event::Delete(_))
                        | Ok(watcher::Event::InitDone) => Some(()),
                        Ok(_) => None,
                        Err(e) => {
                            warn!(kind = %kind, "watch error: {}", e);
                            None
                        }
                    }
                }
            })
            .boxed()
    }
}

#[async_trait]
impl<K: ClientResource + HasStatus> StatusClient<K> for KubeResourceClient<K> {
    async fn apply_status(&self, namespace: &str, name: &str, status: Status) -> Result<K> {
        let patch = serde_json::json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| self.map_err(e, namespace, name))
    }
}
