//! Deployment descriptor loading and per-service entries.
//!
//! A [`TopologyStore`] is read once at startup; [`ServiceEntry`] values are
//! cut from it with defaults (endpoint and credentials) already applied.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::ExposeSecret;
use switchyard_broker::{BrokerEndpoint, Credentials};
use tracing::{debug, info};

use crate::document::{
    BrokerOptions, MessageDeclaration, MessageKind, ServiceDocument, TopologyDocument,
};
use crate::error::{Result, TopologyError};

/// File extension of deployment descriptors.
pub const DESCRIPTOR_EXTENSION: &str = "idep";

/// Loaded, validated deployment topology.
///
/// Immutable once constructed; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct TopologyStore {
    document: TopologyDocument,
    source: Option<PathBuf>,
}

impl TopologyStore {
    /// Path of the descriptor for a deployment: `<dir>/<deployment>.idep`.
    pub fn locate(dir: impl AsRef<Path>, deployment_code: &str) -> PathBuf {
        dir.as_ref()
            .join(format!("{deployment_code}.{DESCRIPTOR_EXTENSION}"))
    }

    /// Loads the descriptor of a deployment from a directory.
    pub fn open(dir: impl AsRef<Path>, deployment_code: &str) -> Result<Self> {
        let mut store = Self::from_path(Self::locate(dir, deployment_code))?;
        if store.document.deployment_code.is_none() {
            store.document.deployment_code = Some(deployment_code.to_string());
        }
        Ok(store)
    }

    /// Loads a descriptor from an explicit file path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TopologyError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let mut store = Self::parse(&content)?;
        store.source = Some(path.to_path_buf());
        info!(
            path = %path.display(),
            services = store.document.services.len(),
            "topology loaded"
        );
        Ok(store)
    }

    /// Parses and validates a descriptor held in memory.
    pub fn parse(content: &str) -> Result<Self> {
        let document: TopologyDocument = serde_json::from_str(content)?;
        Self::from_document(document)
    }

    pub fn from_document(document: TopologyDocument) -> Result<Self> {
        validate(&document)?;
        Ok(Self {
            document,
            source: None,
        })
    }

    /// Overrides the deployment code used to derive service accounts.
    pub fn with_deployment_code(mut self, deployment_code: impl Into<String>) -> Self {
        self.document.deployment_code = Some(deployment_code.into());
        self
    }

    pub fn deployment_code(&self) -> Option<&str> {
        self.document.deployment_code.as_deref()
    }

    /// The file this topology was read from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Service codes in declaration order.
    pub fn service_codes(&self) -> impl Iterator<Item = &str> {
        self.document.services.iter().map(|s| s.service_code.as_str())
    }

    /// Returns the entry of the given service identity.
    pub fn load(&self, service_code: &str) -> Result<Arc<ServiceEntry>> {
        let service = self
            .document
            .services
            .iter()
            .find(|s| s.service_code == service_code)
            .ok_or_else(|| TopologyError::ServiceNotDeclared(service_code.to_string()))?;

        let credentials = self.default_credentials(service);
        let listener_credentials = self
            .service_account(service)
            .unwrap_or_else(|| credentials.clone());
        debug!(
            service = %service_code,
            user = %credentials.username(),
            listener_user = %listener_credentials.username(),
            "service entry loaded"
        );

        Ok(Arc::new(ServiceEntry {
            deployment_code: self.document.deployment_code.clone(),
            endpoint: BrokerEndpoint::new(
                service
                    .host
                    .clone()
                    .unwrap_or_else(|| BrokerEndpoint::DEFAULT_HOST.to_string()),
                service.port.unwrap_or(BrokerEndpoint::DEFAULT_PORT),
                service
                    .vhost
                    .clone()
                    .unwrap_or_else(|| BrokerEndpoint::DEFAULT_VHOST.to_string()),
            ),
            credentials,
            listener_credentials,
            service: service.clone(),
        }))
    }

    /// Service options, then any service's options, then the derived
    /// service account, then guest.
    fn default_credentials(&self, service: &ServiceDocument) -> Credentials {
        if let Some(creds) = service.broker_options.as_ref().and_then(admin_credentials) {
            return creds;
        }
        if let Some(creds) = self
            .document
            .services
            .iter()
            .filter_map(|s| s.broker_options.as_ref())
            .find_map(admin_credentials)
        {
            return creds;
        }
        self.service_account(service)
            .unwrap_or_else(Credentials::guest)
    }

    /// `<service>_0@<deployment>`, when the deployment code is known.
    fn service_account(&self, service: &ServiceDocument) -> Option<Credentials> {
        let deployment = self.document.deployment_code.as_deref()?;
        let account = format!("{}_0@{deployment}", service.service_code);
        Some(Credentials::new(account.clone(), account))
    }
}

fn admin_credentials(options: &BrokerOptions) -> Option<Credentials> {
    let user = options.admin_user.as_deref().filter(|u| !u.is_empty())?;
    let password = options.admin_password.as_ref()?.expose_secret();
    if password.is_empty() {
        return None;
    }
    Some(Credentials::new(user, password))
}

fn validate(document: &TopologyDocument) -> Result<()> {
    let mut services = HashSet::new();
    for service in &document.services {
        if service.service_code.is_empty() {
            return Err(TopologyError::Malformed(
                "service entry with an empty ServiceCode".to_string(),
            ));
        }
        if !services.insert(service.service_code.as_str()) {
            return Err(TopologyError::Malformed(format!(
                "service '{}' is declared more than once",
                service.service_code
            )));
        }

        for kind in MessageKind::ALL {
            let mut codes = HashSet::new();
            for decl in service.group(kind) {
                if !codes.insert(decl.code.as_str()) {
                    return Err(TopologyError::DuplicateMessageCode {
                        service: service.service_code.clone(),
                        kind,
                        code: decl.code.clone(),
                    });
                }
                if kind.has_input_queues() && decl.input_queues.iter().any(|q| q.name.is_empty()) {
                    return Err(TopologyError::Malformed(format!(
                        "{kind} '{}' of service '{}' has an input queue without a name",
                        decl.code, service.service_code
                    )));
                }
            }
        }
    }
    Ok(())
}

/// The declarations of one service plus its resolved broker defaults.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    deployment_code: Option<String>,
    endpoint: BrokerEndpoint,
    credentials: Credentials,
    listener_credentials: Credentials,
    service: ServiceDocument,
}

impl ServiceEntry {
    pub fn service_code(&self) -> &str {
        &self.service.service_code
    }

    pub fn deployment_code(&self) -> Option<&str> {
        self.deployment_code.as_deref()
    }

    /// Service-level broker coordinates, with descriptor defaults applied.
    pub fn default_endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Credentials used when a declaration names none.
    pub fn default_credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Credentials consumer loops connect with when a declaration names none.
    ///
    /// The service's own account when the deployment code is known. Admin
    /// accounts from `MessageBrokerOptions` apply to outbound routes only.
    pub fn listener_credentials(&self) -> &Credentials {
        &self.listener_credentials
    }

    pub fn group(&self, kind: MessageKind) -> &[MessageDeclaration] {
        self.service.group(kind)
    }

    /// Finds a declaration by code within one group.
    pub fn find(&self, kind: MessageKind, code: &str) -> Option<&MessageDeclaration> {
        self.group(kind).iter().find(|d| d.code == code)
    }

    /// Every declaration with its group, in group order.
    pub fn declarations(&self) -> impl Iterator<Item = (MessageKind, &MessageDeclaration)> {
        MessageKind::ALL
            .into_iter()
            .flat_map(move |kind| self.group(kind).iter().map(move |d| (kind, d)))
    }
}
