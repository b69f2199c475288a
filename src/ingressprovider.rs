use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

/// A Minecraft server's connection details, as published to the ingress
/// frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("domain not found")]
    DomainNotFound,
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
    #[error("error creating domain")]
    DomainCreationFailed,
    #[error("error creating backendset")]
    BackendSetCreationFailed,
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Publishes reachable frontends for ready game servers. Implementations
/// talk to an external edge provider; the controller wiring only sees this
/// trait.
#[async_trait]
pub trait IngressProvider {
    /// Creates an ingress and returns its id.
    async fn create(&self, host_name: &str, backend_set: &[Backend]) -> Result<String, IngressError>;

    /// Updates an existing ingress' backends.
    async fn update(&self, host_name: &str, backend_set: &[Backend]) -> Result<(), IngressError>;

    /// Deletes an existing ingress.
    async fn delete(&self, id: &str) -> Result<(), IngressError>;
}
