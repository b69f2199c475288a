use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingressprovider::{Backend, IngressError, IngressProvider};

pub const ENDPOINT: &str = "https://api.tcpshield.com";
pub const RESOURCE_PREFIX: &str = "singularity-";

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "backend_set_id_is_unset")]
    pub backend_set_id: u32,
    pub bac: bool,
}

fn backend_set_id_is_unset(id: &u32) -> bool {
    *id == 0
}

#[derive(Debug, Clone, Deserialize)]
pub struct Domain {
    pub id: u32,
    pub verified: bool,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub descriptor: DomainDescriptor,
}

#[derive(Debug, Deserialize)]
pub struct DomainResponse {
    pub data: Option<Domain>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSetDescriptor {
    pub name: String,
    pub proxy_protocol: bool,
    pub backends: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSet {
    pub id: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub descriptor: BackendSetDescriptor,
}

#[derive(Debug, Deserialize)]
pub struct BackendSetResponse {
    pub data: Option<BackendSetId>,
}

#[derive(Debug, Deserialize)]
pub struct BackendSetId {
    pub id: u32,
}

/// TCPShield-backed ingress provider. Domains and backend sets are managed
/// under a `singularity-` prefixed namespace inside the configured network.
pub struct TcpShieldProvider {
    api_key: String,
    network_id: u32,
    client: reqwest::Client,
}

impl TcpShieldProvider {
    pub fn new(api_key: String, network_id: u32) -> Self {
        TcpShieldProvider {
            api_key,
            network_id,
            client: reqwest::Client::new(),
        }
    }

    /// Creates or updates the backend set for a hostname and returns its id.
    async fn update_backend_set(
        &self,
        host_name: &str,
        backend_set: &[Backend],
    ) -> Result<u32, IngressError> {
        let list: Vec<BackendSet> = self
            .get(&format!("{}/networks/{}/backendSets", ENDPOINT, self.network_id))
            .await?;

        let existing = list
            .iter()
            .find(|set| set.descriptor.name == format!("{}{}", RESOURCE_PREFIX, host_name))
            .map(|set| set.id);

        let descriptor = BackendSetDescriptor {
            name: format!("{}{}", RESOURCE_PREFIX, host_name),
            proxy_protocol: false,
            backends: convert_backend_set(backend_set),
        };

        match existing {
            None => {
                let response = self
                    .client
                    .post(format!("{}/networks/{}/backendSets", ENDPOINT, self.network_id))
                    .header(API_KEY_HEADER, &self.api_key)
                    .json(&descriptor)
                    .send()
                    .await?;
                let status = response.status().as_u16();
                if status != 200 {
                    return Err(IngressError::UnexpectedStatus(status));
                }

                let body: BackendSetResponse = response.json().await?;
                body.data
                    .map(|data| data.id)
                    .ok_or(IngressError::BackendSetCreationFailed)
            }
            Some(id) => {
                let response = self
                    .client
                    .patch(format!(
                        "{}/networks/{}/backendSets/{}",
                        ENDPOINT, self.network_id, id
                    ))
                    .header(API_KEY_HEADER, &self.api_key)
                    .json(&descriptor)
                    .send()
                    .await?;
                let status = response.status().as_u16();
                if status != 200 {
                    return Err(IngressError::UnexpectedStatus(status));
                }
                Ok(id)
            }
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, IngressError> {
        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(IngressError::UnexpectedStatus(status));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl IngressProvider for TcpShieldProvider {
    async fn create(&self, host_name: &str, backend_set: &[Backend]) -> Result<String, IngressError> {
        let backend_set_id = self.update_backend_set(host_name, backend_set).await?;

        let descriptor = DomainDescriptor {
            name: host_name.to_string(),
            backend_set_id,
            bac: false,
        };

        let response = self
            .client
            .post(format!("{}/networks/{}/domains", ENDPOINT, self.network_id))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&descriptor)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(IngressError::UnexpectedStatus(status));
        }

        let body: DomainResponse = response.json().await?;
        let domain = body.data.ok_or(IngressError::DomainCreationFailed)?;
        Ok(domain.id.to_string())
    }

    async fn update(&self, host_name: &str, backend_set: &[Backend]) -> Result<(), IngressError> {
        let list: Vec<Domain> = self
            .get(&format!("{}/networks/{}/domains", ENDPOINT, self.network_id))
            .await?;

        let id = list
            .iter()
            .find(|domain| domain.descriptor.name == host_name)
            .map(|domain| domain.id)
            .ok_or(IngressError::DomainNotFound)?;

        let backend_set_id = self.update_backend_set(host_name, backend_set).await?;

        let descriptor = DomainDescriptor {
            name: host_name.to_string(),
            backend_set_id,
            bac: false,
        };

        let response = self
            .client
            .patch(format!(
                "{}/networks/{}/domains/{}",
                ENDPOINT, self.network_id, id
            ))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&descriptor)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(IngressError::UnexpectedStatus(status));
        }

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IngressError> {
        let response = self
            .client
            .delete(format!(
                "{}/networks/{}/domains/{}",
                ENDPOINT, self.network_id, id
            ))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(IngressError::UnexpectedStatus(status));
        }

        Ok(())
    }
}

fn convert_backend_set(set: &[Backend]) -> Vec<String> {
    set.iter()
        .map(|backend| format!("{}:{}", backend.ip, backend.port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn backends_render_as_host_port() {
        let set = vec![
            Backend { ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port: 25565 },
            Backend { ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port: 25566 },
        ];
        assert_eq!(
            convert_backend_set(&set),
            vec!["10.0.0.1:25565".to_string(), "10.0.0.2:25566".to_string()]
        );
    }

    #[test]
    fn unset_backend_set_id_is_omitted() {
        let descriptor = DomainDescriptor {
            name: "play.example.com".to_string(),
            backend_set_id: 0,
            bac: false,
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert!(value.get("backend_set_id").is_none());

        let descriptor = DomainDescriptor { backend_set_id: 7, ..descriptor };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["backend_set_id"], 7);
    }

    #[test]
    fn domain_list_deserializes_with_flattened_descriptor() {
        let body = r#"[{
            "id": 3,
            "verified": true,
            "updated_at": "2022-01-01T00:00:00Z",
            "created_at": "2022-01-01T00:00:00Z",
            "name": "play.example.com",
            "backend_set_id": 9,
            "bac": false
        }]"#;

        let list: Vec<Domain> = serde_json::from_str(body).unwrap();
        assert_eq!(list[0].id, 3);
        assert_eq!(list[0].descriptor.name, "play.example.com");
        assert_eq!(list[0].descriptor.backend_set_id, 9);
    }
}
