//! Naming HTTP calls
//!
//! Thin mapping of naming operations onto the v1 naming endpoints. Request
//! signing, failover, and retries are the transport's business.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use sregistry_api::naming::{
    BEAT_OK, BeatInfo, BeatResult, INSTANCE_BEAT_PATH, INSTANCE_LIST_PATH, INSTANCE_PATH, Instance,
    SERVICE_LIST_PATH, SERVICE_PATH, ServiceDetail, ServiceInfo, ServiceList, grouped_name,
};
use sregistry_api::{CLUSTER_NAME, CLUSTERS, GROUP_NAME, NAMESPACE_ID, SERVICE_NAME};
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::http::{RegistryHttpClient, RegistryRequest};

/// Naming endpoints scoped to one namespace and group
#[derive(Clone)]
pub struct NamingProxy {
    transport: Arc<RegistryHttpClient>,
    namespace: String,
    group_name: String,
    read_timeout: Duration,
    beat_period_ms: u64,
}

impl NamingProxy {
    pub fn new(
        transport: Arc<RegistryHttpClient>,
        namespace: &str,
        group_name: &str,
        read_timeout: Duration,
        beat_period_ms: u64,
    ) -> Self {
        Self {
            transport,
            namespace: namespace.to_string(),
            group_name: group_name.to_string(),
            read_timeout,
            beat_period_ms,
        }
    }

    pub fn transport(&self) -> &Arc<RegistryHttpClient> {
        &self.transport
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    fn grouped(&self, service_name: &str) -> String {
        grouped_name(&self.group_name, service_name)
    }

    fn scoped(&self, request: RegistryRequest, service_name: &str) -> RegistryRequest {
        request
            .param(NAMESPACE_ID, &self.namespace)
            .param(SERVICE_NAME, self.grouped(service_name))
            .param(GROUP_NAME, &self.group_name)
    }

    fn instance_request(
        &self,
        request: RegistryRequest,
        service_name: &str,
        instance: &Instance,
    ) -> Result<RegistryRequest> {
        let metadata =
            serde_json::to_string(&instance.metadata).map_err(|e| ClientError::Other(e.into()))?;
        Ok(self
            .scoped(request, service_name)
            .param(CLUSTER_NAME, &instance.cluster_name)
            .param("ip", &instance.ip)
            .param("port", instance.port)
            .param("weight", instance.weight)
            .param("enabled", instance.enabled)
            .param("healthy", instance.is_healthy())
            .param("ephemeral", instance.ephemeral)
            .param("metadata", metadata))
    }

    /// `POST /v1/ns/instance`
    pub async fn register(&self, service_name: &str, instance: &Instance) -> Result<()> {
        info!(
            "[REGISTER-SERVICE] {} registering service {} with instance: {}:{}",
            self.namespace, service_name, instance.ip, instance.port
        );

        let request = self.instance_request(
            RegistryRequest::post(INSTANCE_PATH).operation("register"),
            service_name,
            instance,
        )?;
        self.transport.send(request).await?.error_for_status()?;
        Ok(())
    }

    /// `DELETE /v1/ns/instance`
    pub async fn deregister(&self, service_name: &str, instance: &Instance) -> Result<()> {
        info!(
            "[DEREGISTER-SERVICE] {} deregistering service {} with instance: {}:{}",
            self.namespace, service_name, instance.ip, instance.port
        );

        let request = self
            .scoped(
                RegistryRequest::delete(INSTANCE_PATH).operation("deregister"),
                service_name,
            )
            .param(CLUSTER_NAME, &instance.cluster_name)
            .param("ip", &instance.ip)
            .param("port", instance.port)
            .param("ephemeral", instance.ephemeral);

        let response = self.transport.send(request).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Err(ClientError::InstanceNotFound {
                service: service_name.to_string(),
                ip: instance.ip.clone(),
                port: instance.port,
            });
        }
        response.error_for_status()?;
        Ok(())
    }

    /// `GET /v1/ns/instance`
    ///
    /// With `healthy_only` an unhealthy instance is reported as not found.
    pub async fn get_instance(
        &self,
        service_name: &str,
        ip: &str,
        port: u16,
        cluster_name: &str,
        healthy_only: bool,
    ) -> Result<Instance> {
        let request = self
            .scoped(
                RegistryRequest::get(INSTANCE_PATH).operation("get_instance"),
                service_name,
            )
            .param("cluster", cluster_name)
            .param("ip", ip)
            .param("port", port)
            .param("healthyOnly", healthy_only);

        let response = self.transport.send(request).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Err(ClientError::InstanceNotFound {
                service: service_name.to_string(),
                ip: ip.to_string(),
                port,
            });
        }
        response.error_for_status()?.json()
    }

    /// `PUT /v1/ns/instance`
    pub async fn update_instance(&self, service_name: &str, instance: &Instance) -> Result<()> {
        debug!(
            "[UPDATE-SERVICE] {} updating service {} with instance: {}:{}",
            self.namespace, service_name, instance.ip, instance.port
        );

        let request = self.instance_request(
            RegistryRequest::put(INSTANCE_PATH).operation("update"),
            service_name,
            instance,
        )?;
        self.transport.send(request).await?.error_for_status()?;
        Ok(())
    }

    /// `PUT /v1/ns/instance/beat`
    ///
    /// Servers that answer with a plain `ok` body are treated as acknowledging.
    pub async fn send_beat(&self, service_name: &str, instance: &Instance) -> Result<BeatResult> {
        let grouped = self.grouped(service_name);
        let beat = BeatInfo::from_instance(&grouped, instance, self.beat_period_ms);
        let beat = serde_json::to_string(&beat).map_err(|e| ClientError::Other(e.into()))?;

        let request = self
            .scoped(
                RegistryRequest::put(INSTANCE_BEAT_PATH).operation("beat"),
                service_name,
            )
            .param("ephemeral", instance.ephemeral)
            .param("beat", beat);

        let response = self.transport.send(request).await?.error_for_status()?;
        match serde_json::from_str(&response.body) {
            Ok(result) => Ok(result),
            Err(e) => {
                debug!(
                    service = %service_name,
                    body = %response.body,
                    "Beat answer is not a beat result, treating as acknowledged: {}", e
                );
                Ok(BeatResult {
                    code: BEAT_OK,
                    ..Default::default()
                })
            }
        }
    }

    /// `GET /v1/ns/instance/list`
    ///
    /// `checksum` is the revision the caller already holds; with `wait` the
    /// server may hold the request until the list changes.
    pub async fn query_instances(
        &self,
        service_name: &str,
        checksum: Option<&str>,
        wait: Option<Duration>,
    ) -> Result<ServiceInfo> {
        let mut request = self
            .scoped(
                RegistryRequest::get(INSTANCE_LIST_PATH).operation("query_instances"),
                service_name,
            )
            .param(CLUSTERS, "")
            .param("healthyOnly", false);

        if let Some(checksum) = checksum.filter(|c| !c.is_empty()) {
            request = request.param("checksum", checksum);
        }
        if let Some(wait) = wait {
            request = request
                .param("waitMs", wait.as_millis())
                .timeout(wait + self.read_timeout);
        }

        let response = self.transport.send(request).await?.error_for_status()?;
        response.json()
    }

    /// `GET /v1/ns/service`
    pub async fn get_service(&self, service_name: &str) -> Result<ServiceDetail> {
        let request = self.scoped(
            RegistryRequest::get(SERVICE_PATH).operation("get_service"),
            service_name,
        );
        let response = self.transport.send(request).await?.error_for_status()?;
        response.json()
    }

    /// `GET /v1/ns/service/list`
    pub async fn list_services(&self, page_no: u32, page_size: u32) -> Result<ServiceList> {
        let request = RegistryRequest::get(SERVICE_LIST_PATH)
            .operation("list_services")
            .param(NAMESPACE_ID, &self.namespace)
            .param(GROUP_NAME, &self.group_name)
            .param("pageNo", page_no.max(1))
            .param("pageSize", page_size.max(1));
        let response = self.transport.send(request).await?.error_for_status()?;
        response.json()
    }
}
