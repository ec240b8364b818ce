//! Connection factories: the `ConnectionFactory` seam shared by direct
//! connections and the pool, and the TCP / ldaps:// implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionOptions};
use crate::error::LdapError;
use crate::extended::DecoderRegistry;
use crate::tls;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_LDAP_PORT: u16 = 389;
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// Source of ready-to-use connections.
pub trait ConnectionFactory: Send + Sync {
    type Connection: Send + 'static;

    fn get_connection(&self) -> BoxFuture<'_, Result<Self::Connection, LdapError>>;

    /// Obtains a connection in the background and hands it to `handler`.
    /// Fails immediately when called outside a tokio runtime.
    fn get_connection_async<F>(&self, handler: F) -> Result<(), LdapError>
    where
        Self: Sized + Clone + 'static,
        F: FnOnce(Result<Self::Connection, LdapError>) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| LdapError::IllegalState("no tokio runtime"))?;
        let factory = self.clone();
        runtime.spawn(async move {
            handler(factory.get_connection().await);
        });
        Ok(())
    }
}

/// Opens a new TCP (or TLS for ldaps://) connection per request, optionally
/// performing a simple bind before handing it out.
#[derive(Clone)]
pub struct LdapConnectionFactory {
    uri: String,
    host: String,
    port: u16,
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Duration,
    bind: Option<(String, String)>,
    options: ConnectionOptions,
    registry: Arc<DecoderRegistry>,
}

impl std::fmt::Debug for LdapConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnectionFactory")
            .field("uri", &self.uri)
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("bind_dn", &self.bind.as_ref().map(|(dn, _)| dn.as_str()))
            .finish()
    }
}

impl LdapConnectionFactory {
    /// ldaps:// URIs verify the server against the system roots; use
    /// `with_tls_config` or `from_config` for anything else.
    pub fn new(uri: &str) -> Result<Self> {
        let (secure, host, port) = parse_ldap_uri(uri)?;
        let tls = if secure {
            Some(tls::client_config_with_ca(None)?)
        } else {
            None
        };
        Ok(Self {
            uri: uri.to_string(),
            host,
            port,
            tls,
            connect_timeout: Duration::from_millis(crate::config::DEFAULT_CONNECT_TIMEOUT_MS),
            bind: None,
            options: ConnectionOptions::default(),
            registry: Arc::new(DecoderRegistry::with_defaults()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let (secure, host, port) = parse_ldap_uri(&config.server.uri)?;
        let tls = if secure {
            let tls_config = config.tls.clone().unwrap_or_default();
            Some(
                tls::client_config(tls_config.skip_verify.unwrap_or(false), tls_config.ca_file.as_deref())
                    .with_context(|| format!("TLS setup for {}", config.server.uri))?,
            )
        } else {
            None
        };
        Ok(Self {
            uri: config.server.uri.clone(),
            host,
            port,
            tls,
            connect_timeout: config.connect_timeout(),
            bind: config
                .bind
                .as_ref()
                .map(|bind| (bind.binddn.clone(), bind.credentials.clone())),
            options: config.connection_options(),
            registry: Arc::new(DecoderRegistry::with_defaults()),
        })
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Simple bind performed on every new connection.
    pub fn with_bind(mut self, dn: impl Into<String>, password: impl Into<String>) -> Self {
        self.bind = Some((dn.into(), password.into()));
        self
    }

    pub fn with_registry(mut self, registry: Arc<DecoderRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Forces TLS with the given client config, whatever the URI scheme.
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    async fn connect(&self) -> Result<Connection, LdapError> {
        let addr = format!("{}:{}", self.host, self.port);
        let tcp = match tokio::time::timeout(self.connect_timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(LdapError::Connect(format!("{}: {}", addr, e))),
            Err(_) => {
                return Err(LdapError::Connect(format!(
                    "{}: timed out after {:?}",
                    addr, self.connect_timeout
                )))
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let connection = match &self.tls {
            Some(config) => {
                let server_name = ServerName::try_from(self.host.clone())
                    .map_err(|_| LdapError::Connect(format!("Invalid hostname for TLS SNI: {}", self.host)))?;
                let handshake = TlsConnector::from(Arc::clone(config)).connect(server_name, tcp);
                let stream = match tokio::time::timeout(self.connect_timeout, handshake).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(LdapError::Connect(format!("TLS handshake to {} failed: {}", addr, e))),
                    Err(_) => return Err(LdapError::Connect(format!("TLS handshake to {} timed out", addr))),
                };
                Connection::from_stream(stream, self.options.clone(), Arc::clone(&self.registry))
            }
            None => Connection::from_stream(tcp, self.options.clone(), Arc::clone(&self.registry)),
        };
        debug!("Connected to {} (connection {})", self.uri, connection.id());

        if let Some((dn, password)) = &self.bind {
            let bound = match connection.simple_bind(dn, password) {
                Ok(future) => future.result().await,
                Err(e) => Err(e),
            };
            if let Err(e) = bound {
                warn!("Bind as {} on {} failed: {}", dn, self.uri, e);
                connection.close();
                return Err(e);
            }
            info!("Connection {} bound as {}", connection.id(), dn);
        }
        Ok(connection)
    }
}

impl ConnectionFactory for LdapConnectionFactory {
    type Connection = Connection;

    fn get_connection(&self) -> BoxFuture<'_, Result<Connection, LdapError>> {
        Box::pin(self.connect())
    }
}

/// Parse "ldap://host[:port][/...]" or "ldaps://host[:port][/...]" to
/// (secure, host, port). IPv6 hosts are written in brackets.
pub fn parse_ldap_uri(uri: &str) -> Result<(bool, String, u16)> {
    let (secure, rest) = if let Some(rest) = uri.strip_prefix("ldaps://") {
        (true, rest)
    } else if let Some(rest) = uri.strip_prefix("ldap://") {
        (false, rest)
    } else {
        anyhow::bail!("Invalid LDAP URI scheme: {}", uri);
    };
    let authority = rest.split('/').next().unwrap_or_default();
    let default_port = if secure { DEFAULT_LDAPS_PORT } else { DEFAULT_LDAP_PORT };

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("Unterminated IPv6 address in URI: {}", uri))?;
        match after.strip_prefix(':') {
            Some(port) => (host, parse_port(port, uri)?),
            None if after.is_empty() => (host, default_port),
            None => anyhow::bail!("Unexpected characters after IPv6 address in URI: {}", uri),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, parse_port(port, uri)?),
            None => (authority, default_port),
        }
    };
    if host.is_empty() {
        anyhow::bail!("No host in URI: {}", uri);
    }
    Ok((secure, host.to_string(), port))
}

fn parse_port(port: &str, uri: &str) -> Result<u16> {
    port.parse()
        .with_context(|| format!("Invalid port in URI: {}", uri))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use crate::ldap_protocol::{BindAuthentication, ProtocolOp};
    use crate::test_support::{init_tracing, MockServer};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn test_parse_ldap_uri() {
        assert_eq!(
            parse_ldap_uri("ldap://localhost:1389").unwrap(),
            (false, "localhost".to_string(), 1389)
        );
        assert_eq!(
            parse_ldap_uri("ldaps://ldap.example.com").unwrap(),
            (true, "ldap.example.com".to_string(), 636)
        );
        assert_eq!(
            parse_ldap_uri("ldap://ldap.example.com/dc=example,dc=com").unwrap(),
            (false, "ldap.example.com".to_string(), 389)
        );
        assert_eq!(
            parse_ldap_uri("ldap://[::1]:3389").unwrap(),
            (false, "::1".to_string(), 3389)
        );
        assert_eq!(parse_ldap_uri("ldaps://[fe80::1]").unwrap().2, 636);
    }

    #[test]
    fn test_parse_ldap_uri_invalid() {
        assert!(parse_ldap_uri("http://localhost:389").is_err());
        assert!(parse_ldap_uri("ldap://").is_err());
        assert!(parse_ldap_uri("ldap://localhost:notaport").is_err());
        assert!(parse_ldap_uri("ldap://localhost:70000").is_err());
        assert!(parse_ldap_uri("ldap://[::1").is_err());
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.server.uri = "ldap://127.0.0.1:1389".to_string();
        config.connection.request_timeout_ms = Some(500);
        config.bind = Some(crate::config::BindConfig {
            binddn: "cn=admin".to_string(),
            credentials: "secret".to_string(),
        });
        let factory = LdapConnectionFactory::from_config(&config).unwrap();
        assert_eq!(factory.uri(), "ldap://127.0.0.1:1389");
        assert_eq!(factory.options().request_timeout, Some(Duration::from_millis(500)));
        assert!(factory.tls.is_none());
        assert_eq!(factory.bind, Some(("cn=admin".to_string(), "secret".to_string())));

        config.server.uri = "ldaps://127.0.0.1".to_string();
        config.tls = Some(crate::config::TlsConfig {
            skip_verify: Some(true),
            ca_file: None,
        });
        let factory = LdapConnectionFactory::from_config(&config).unwrap();
        assert!(factory.tls.is_some());
        assert_eq!(factory.port, 636);
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("ldap://{}", listener.local_addr().unwrap());
        (listener, uri)
    }

    #[tokio::test]
    async fn test_connect_and_bind() {
        init_tracing();
        let (listener, uri) = listen().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = MockServer::new(stream);
            let bind = server.recv().await;
            server.reply_success(&bind).await;
            bind
        });

        let factory = LdapConnectionFactory::new(&uri)
            .unwrap()
            .with_bind("cn=admin,dc=example,dc=com", "secret");
        let connection = factory.get_connection().await.unwrap();
        assert!(connection.is_valid());

        let bind = server.await.unwrap();
        match bind.protocol_op {
            ProtocolOp::BindRequest(request) => {
                assert_eq!(request.name, "cn=admin,dc=example,dc=com");
                assert_eq!(request.authentication, BindAuthentication::Simple("secret".to_string()));
            }
            other => panic!("Expected BindRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_bind_is_reported() {
        let (listener, uri) = listen().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = MockServer::new(stream);
            let bind = server.recv().await;
            server
                .send(
                    bind.message_id,
                    ProtocolOp::BindResponse(crate::ldap_protocol::BindResponse {
                        result: crate::ldap_protocol::LdapResult::new(ResultCode::INVALID_CREDENTIALS),
                        server_sasl_creds: None,
                    }),
                )
                .await;
            // Keep the socket open until the client unbinds.
            server.is_closed().await
        });

        let factory = LdapConnectionFactory::new(&uri).unwrap().with_bind("cn=admin", "wrong");
        let err = factory.get_connection().await.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::INVALID_CREDENTIALS);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let (listener, uri) = listen().await;
        drop(listener);
        let factory = LdapConnectionFactory::new(&uri).unwrap();
        let err = factory.get_connection().await.unwrap_err();
        assert!(matches!(err, LdapError::Connect(_)));
        assert_eq!(err.result_code(), ResultCode::CLIENT_SIDE_CONNECT_ERROR);
    }

    #[tokio::test]
    async fn test_get_connection_async() {
        let (listener, uri) = listen().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            MockServer::new(stream).serve().await;
        });

        let factory = LdapConnectionFactory::new(&uri).unwrap();
        let (tx, rx) = oneshot::channel();
        factory
            .get_connection_async(move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        let connection = rx.await.unwrap().unwrap();
        let who = connection
            .extended(crate::ldap_protocol::ExtendedRequest::who_am_i())
            .unwrap();
        assert!(who.result().await.is_ok());
    }

    #[test]
    fn test_get_connection_async_without_runtime() {
        let factory = LdapConnectionFactory::new("ldap://127.0.0.1:389").unwrap();
        let err = factory.get_connection_async(|_| {}).unwrap_err();
        assert!(matches!(err, LdapError::IllegalState(_)));
    }
}
