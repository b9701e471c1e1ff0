// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::runtime::{
    ContainerHealth, ContainerInspection, ContainerRuntime, ContainerSpec, ContainerStats,
    ManagedContainer, RuntimeError, MANAGED_LABEL, MODULE_LABEL,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HealthStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

pub struct DockerContainerRuntime {
    docker: Docker,
}

fn is_status(err: &DockerError, code: u16) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

impl DockerContainerRuntime {
    pub fn new(socket_path: Option<String>) -> Result<Self, RuntimeError> {
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(&path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| RuntimeError::Unavailable(format!(
                "Failed to connect to Docker at {}: {}\n\n\
                 Ensure Docker is running and the socket path is correct.",
                path, e
            )))?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Unavailable(format!(
                "Failed to connect to Docker: {}\n\n\
                 Common causes:\n\
                 - Docker daemon not running (check: docker ps)\n\
                 - Permission denied accessing Docker socket\n\
                 - Current user not in 'docker' group",
                e
            )))?
        };

        Ok(Self { docker })
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let policy = &spec.policy;

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .port_bindings
            .iter()
            .map(|(internal, external)| {
                (
                    format!("{}/tcp", internal),
                    Some(vec![PortBinding {
                        host_ip: Some(spec.host_ip.clone()),
                        host_port: Some(external.to_string()),
                    }]),
                )
            })
            .collect();

        // A read-only root still needs somewhere to write scratch files.
        let tmpfs = policy
            .read_only_rootfs
            .then(|| HashMap::from([("/tmp".to_string(), "rw,noexec,nosuid,size=64m".to_string())]));

        HostConfig {
            memory: Some(policy.ceilings.memory_bytes),
            nano_cpus: Some(policy.ceilings.nano_cpus),
            pids_limit: Some(policy.ceilings.pids_limit),
            network_mode: spec.network.clone(),
            port_bindings: Some(port_bindings),
            privileged: Some(policy.privileged),
            readonly_rootfs: Some(policy.read_only_rootfs),
            cap_drop: (!policy.cap_drop.is_empty()).then(|| policy.cap_drop.clone()),
            security_opt: Some(policy.security_opt.clone()),
            tmpfs,
            auto_remove: Some(false),
            ..Default::default()
        }
    }

    fn cpu_percent(stats: &Stats) -> f64 {
        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0)) as f64;
        let cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;

        if cpu_delta > 0.0 && system_delta > 0.0 {
            (cpu_delta / system_delta) * cpus * 100.0
        } else {
            0.0
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("Cannot connect to Docker daemon: {}", e)))?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image {} present locally, skipping pull", image);
            return Ok(());
        }

        info!("Pulling image: {}", image);
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(RuntimeError::PullFailed(format!(
                    "Failed to pull image {}: {}\n\n\
                     Check that the registry is reachable and the tag exists.\n\
                     Try manually: docker pull {}",
                    image, e, image
                )));
            }
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn image_labels(&self, image: &str) -> Result<HashMap<String, String>, RuntimeError> {
        let inspect = self.docker.inspect_image(image).await.map_err(|e| {
            if is_status(&e, 404) {
                RuntimeError::NotFound(image.to_string())
            } else {
                RuntimeError::Other(format!("Failed to inspect image {}: {}", image, e))
            }
        })?;

        Ok(inspect.config.and_then(|c| c.labels).unwrap_or_default())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .port_bindings
            .keys()
            .map(|port| (format!("{}/tcp", port), HashMap::new()))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            user: spec.policy.user.clone(),
            exposed_ports: Some(exposed_ports),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(format!("{}: {}", spec.name, e)))?;

        info!(
            container = %spec.name,
            id = %response.id,
            profile = %spec.policy.profile,
            "Container created"
        );
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        match self.docker.start_container(id, None::<StartContainerOptions<String>>).await {
            Ok(()) => Ok(()),
            // 304: already running
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(RuntimeError::StartFailed(format!("{}: {}", id, e))),
        }
    }

    async fn stop(&self, id: &str, grace_secs: i64) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: grace_secs };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => {
                debug!(container = id, "Container stopped");
                Ok(())
            }
            Err(e) if is_status(&e, 304) || is_status(&e, 404) => Ok(()),
            Err(e) => Err(RuntimeError::StopFailed(format!("{}: {}", id, e))),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool, RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                debug!(container = id, "Container removed");
                Ok(true)
            }
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(RuntimeError::RemoveFailed(format!("{}: {}", id, e))),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    RuntimeError::NotFound(id.to_string())
                } else {
                    RuntimeError::Other(format!("Failed to inspect {}: {}", id, e))
                }
            })?;

        let state = inspect.state.unwrap_or_default();
        let health = match state.health.and_then(|h| h.status) {
            Some(HealthStatusEnum::HEALTHY) => ContainerHealth::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => ContainerHealth::Unhealthy,
            Some(HealthStatusEnum::STARTING) => ContainerHealth::Starting,
            _ => ContainerHealth::None,
        };

        Ok(ContainerInspection {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            running: state.running.unwrap_or(false),
            status: state.status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string()),
            health,
            restart_count: inspect.restart_count.unwrap_or(0),
            started_at: state.started_at,
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let inspection = self.inspect(id).await?;

        // one_shot=false makes the daemon sample twice so precpu_stats is populated.
        let options = Some(StatsOptions {
            stream: false,
            one_shot: false,
        });
        let mut stream = Box::pin(self.docker.stats(id, options));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::Other(format!("No stats returned for {}", id)))?
            .map_err(|e| RuntimeError::Other(format!("Failed to read stats for {}: {}", id, e)))?;

        let (rx, tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        let uptime_seconds = inspection
            .started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .filter(|_| inspection.running)
            .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_seconds().max(0) as u64)
            .unwrap_or(0);

        Ok(ContainerStats {
            cpu_percent: Self::cpu_percent(&stats),
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            uptime_seconds,
            restart_count: inspection.restart_count,
        })
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let filters: HashMap<String, Vec<String>> =
            HashMap::from([("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)])]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Other(format!("Failed to list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ManagedContainer {
                    module: c.labels.and_then(|mut l| l.remove(MODULE_LABEL)),
                    running: c.state.as_deref() == Some("running"),
                    id,
                    name,
                })
            })
            .collect())
    }
}
