//! Kubernetes job listing for the worker namespace.
//!
//! The scheduler consults existing jobs for two purposes: avoiding redundant
//! emission for tasks whose jobs are still live, and healing task markers
//! that older scheduler versions never wrote. Listing also captures
//! completion counts so finished jobs can be reaped later on.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};

use crate::error::{Error, Result};

/// The slice of a Kubernetes job the scheduler cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    /// The job name.
    pub name: String,
    /// Number of actively running pods.
    pub active: i32,
    /// Number of pods that completed successfully.
    pub succeeded: i32,
}

/// Enumerates the jobs in a configured namespace.
#[async_trait]
pub trait JobLister: Send + Sync {
    /// Returns all jobs in the namespace, keyed by job name.
    async fn list_jobs(&self) -> Result<BTreeMap<String, JobSummary>>;
}

/// Job lister backed by the Kubernetes API.
#[derive(Debug)]
pub struct KubernetesJobLister {
    jobs: Api<Job>,
}

impl KubernetesJobLister {
    /// Creates a lister for the given namespace.
    ///
    /// When `kubeconfig_path` is provided the client authenticates with that
    /// kubeconfig; otherwise configuration is inferred from the environment
    /// (in-cluster service account or the default kubeconfig).
    ///
    /// # Errors
    ///
    /// Returns an error if the client configuration cannot be resolved.
    pub async fn new(namespace: &str, kubeconfig_path: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::orchestrator_with_source(
                        format!("reading kubeconfig {}", path.display()),
                        e,
                    )
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::orchestrator_with_source("loading kubeconfig", e)
                    })?
            }
            None => Config::infer().await.map_err(|e| {
                Error::orchestrator_with_source("inferring kubernetes configuration", e)
            })?,
        };

        let client = Client::try_from(config)
            .map_err(|e| Error::orchestrator_with_source("creating kubernetes client", e))?;

        Ok(Self {
            jobs: Api::namespaced(client, namespace),
        })
    }
}

#[async_trait]
impl JobLister for KubernetesJobLister {
    async fn list_jobs(&self) -> Result<BTreeMap<String, JobSummary>> {
        let list = self
            .jobs
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::orchestrator_with_source("listing jobs", e))?;

        let mut jobs = BTreeMap::new();
        for job in list {
            let Some(name) = job.metadata.name else {
                continue;
            };
            let status = job.status.unwrap_or_default();
            jobs.insert(
                name.clone(),
                JobSummary {
                    name,
                    active: status.active.unwrap_or(0),
                    succeeded: status.succeeded.unwrap_or(0),
                },
            );
        }
        Ok(jobs)
    }
}
