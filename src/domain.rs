//! domain table and SNI certificate selection
//!
//! A domain couples a hostname with its TLS material, document root and
//! the URI keyed handler dicts. Hostnames are matched byte wise, so non
//! ASCII names pass through untouched. At most one domain is marked
//! default; with no mark the first loaded domain serves clients without
//! SNI.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::crypto::aws_lc_rs::sign::any_supported_type;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;

use crate::errors::ServerError;
use crate::handler::{EventHandler, WebsocketConfig};

/// fragment bound installed for JSON event URIs
pub(crate) const MAX_FRAMES_FOR_JSON: u64 = 10_000;

/// one per domain descriptor file inside the configured directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub name: String,
    #[serde(default)]
    pub document_root: PathBuf,
    pub certificate: CertificateFiles,
    #[serde(default, rename = "default")]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateFiles {
    pub file: PathBuf,
    pub key: PathBuf,
}

#[derive(Default)]
pub(crate) struct WebsocketRegistry {
    uri: HashMap<String, WebsocketConfig>,
    fallback: Option<WebsocketConfig>,
}

impl WebsocketRegistry {
    fn lookup(&self, uri: &str) -> Option<WebsocketConfig> {
        self.uri.get(uri).cloned().or_else(|| self.fallback.clone())
    }
}

pub struct Domain {
    name: String,
    document_root: PathBuf,
    is_default: bool,
    certified: Arc<CertifiedKey>,
    websocket: RwLock<WebsocketRegistry>,
    events: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl Domain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_bytes(&self) -> &[u8] {
        self.name.as_bytes()
    }

    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub(crate) fn certified(&self) -> Arc<CertifiedKey> {
        self.certified.clone()
    }

    pub(crate) fn websocket_lookup(&self, uri: &str) -> Option<WebsocketConfig> {
        self.websocket
            .read()
            .expect("websocket registry lock")
            .lookup(uri)
    }

    /// register websocket handling for one URI, or as domain fallback
    /// when `uri` is `None`; existing registrations are never replaced
    pub(crate) fn set_websocket_config(
        &self,
        uri: Option<&str>,
        config: WebsocketConfig,
    ) -> Result<(), ServerError> {
        let mut registry = self.websocket.write().expect("websocket registry lock");
        match uri {
            Some(uri) => {
                if registry.uri.get(uri).map(WebsocketConfig::enabled) == Some(true) {
                    return Err(ServerError::HandlerExists(uri.into()));
                }
                registry.uri.insert(uri.into(), config);
            }
            None => {
                if registry.fallback.is_some() {
                    return Err(ServerError::HandlerExists(self.name.clone()));
                }
                registry.fallback = Some(config);
            }
        }
        Ok(())
    }

    pub(crate) fn event_handler(&self, uri: &str) -> Option<Arc<dyn EventHandler>> {
        self.events
            .read()
            .expect("event registry lock")
            .get(uri)
            .cloned()
    }

    pub(crate) fn has_event_handler(&self, uri: &str) -> bool {
        self.events
            .read()
            .expect("event registry lock")
            .contains_key(uri)
    }

    pub(crate) fn event_handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        self.events
            .read()
            .expect("event registry lock")
            .values()
            .cloned()
            .collect()
    }

    /// register a JSON event handler under a URI and make sure the URI
    /// accepts websocket upgrades
    pub(crate) fn set_event_handler(
        &self,
        uri: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ServerError> {
        let mut events = self.events.write().expect("event registry lock");
        if events.contains_key(uri) {
            return Err(ServerError::HandlerExists(uri.into()));
        }
        events.insert(uri.into(), handler);
        drop(events);

        let mut registry = self.websocket.write().expect("websocket registry lock");
        registry.uri.entry(uri.into()).or_insert_with(|| WebsocketConfig {
            max_frames: MAX_FRAMES_FOR_JSON,
            ..WebsocketConfig::default()
        });
        Ok(())
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("document_root", &self.document_root)
            .field("is_default", &self.is_default)
            .finish()
    }
}

pub struct DomainTable {
    domains: Vec<Arc<Domain>>,
    default_index: usize,
}

impl DomainTable {
    /// load every `*.json` descriptor of a directory
    pub fn load(dir: &Path) -> Result<Self, ServerError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut descriptors = Vec::new();
        for path in paths {
            let raw = std::fs::read_to_string(&path)?;
            let descriptor: DomainDescriptor = serde_json::from_str(&raw)
                .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
            descriptors.push((path, descriptor));
        }
        Self::from_descriptors(dir, descriptors)
    }

    fn from_descriptors(
        dir: &Path,
        descriptors: Vec<(PathBuf, DomainDescriptor)>,
    ) -> Result<Self, ServerError> {
        if descriptors.is_empty() {
            return Err(ServerError::NoDomains(dir.display().to_string()));
        }

        let mut domains = Vec::with_capacity(descriptors.len());
        let mut default_index: Option<usize> = None;

        for (index, (path, descriptor)) in descriptors.into_iter().enumerate() {
            let base = path.parent().unwrap_or(dir);
            let cert_path = resolve(base, &descriptor.certificate.file);
            let key_path = resolve(base, &descriptor.certificate.key);
            let certified = Arc::new(load_certified(&cert_path, &key_path)?);

            if descriptor.is_default {
                if let Some(existing) = default_index {
                    let first: &Arc<Domain> = &domains[existing];
                    return Err(ServerError::DuplicateDefaultDomain(
                        first.name.clone(),
                        descriptor.name,
                    ));
                }
                default_index = Some(index);
            }

            domains.push(Arc::new(Domain {
                name: descriptor.name,
                document_root: descriptor.document_root,
                is_default: descriptor.is_default,
                certified,
                websocket: RwLock::new(WebsocketRegistry::default()),
                events: RwLock::new(HashMap::new()),
            }));
        }

        Ok(Self {
            domains,
            default_index: default_index.unwrap_or(0),
        })
    }

    /// byte wise hostname lookup, first match wins
    pub fn find(&self, hostname: &[u8]) -> Option<Arc<Domain>> {
        self.domains
            .iter()
            .find(|d| d.name.as_bytes() == hostname)
            .cloned()
    }

    /// the marked default, or domain zero when none is marked
    pub fn default_domain(&self) -> Arc<Domain> {
        self.domains[self.default_index].clone()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Domain>> {
        self.domains.iter()
    }
}

impl fmt::Debug for DomainTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainTable")
            .field("domains", &self.domains)
            .field("default_index", &self.default_index)
            .finish()
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn load_certified(cert: &Path, key: &Path) -> Result<CertifiedKey, ServerError> {
    let mut reader = BufReader::new(File::open(cert)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::BadCertificate(cert.display().to_string()));
    }

    let mut reader = BufReader::new(File::open(key)?);
    let key_der = rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| ServerError::BadCertificate(key.display().to_string()))?;
    let signing = any_supported_type(&key_der)
        .map_err(|_| ServerError::BadCertificate(key.display().to_string()))?;

    Ok(CertifiedKey::new(certs, signing))
}

/// selects the certificate at client hello time
///
/// No SNI falls back to the default domain, an unknown name resolves to
/// nothing and rustls answers with a fatal alert.
pub(crate) struct SniResolver {
    table: Arc<DomainTable>,
}

impl SniResolver {
    pub fn new(table: Arc<DomainTable>) -> Self {
        Self { table }
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SniResolver")
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            None => Some(self.table.default_domain().certified()),
            Some(name) => self.table.find(name.as_bytes()).map(|d| d.certified()),
        }
    }
}
