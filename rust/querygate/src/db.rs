use crate::config::AppConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info};

/// Pool of diesel connections for the template store.
pub type PgPool = Pool<PgConnectionManager>;

/// Pool of plain clients for ad-hoc statements whose row shape is only known at runtime.
pub type ClientPool = Pool<ClientConnectionManager>;

pub async fn connect_template_pool(config: &AppConfig) -> Result<PgPool> {
    let endpoint = PgEndpoint::from_config(&config.templates_database_url, config)?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .build(PgConnectionManager { endpoint })
        .await
        .context("failed to build template store connection pool")?;

    match pool.get().await {
        Ok(_) => info!("template store connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial template store connectivity check failed"),
    }

    Ok(pool)
}

pub async fn connect_client_pool(config: &AppConfig) -> Result<ClientPool> {
    let endpoint = PgEndpoint::from_config(&config.database_url, config)?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .build(ClientConnectionManager { endpoint })
        .await
        .context("failed to build query backend connection pool")?;

    match pool.get().await {
        Ok(_) => info!("query backend connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial query backend connectivity check failed"),
    }

    Ok(pool)
}

#[derive(Clone)]
struct PgEndpoint {
    config: PgConfig,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

/// PEM files named by `PGSSLROOTCERT`, `PGSSLCERT` and `PGSSLKEY`.
#[derive(Debug, Clone, Copy, Default)]
struct TlsFiles<'a> {
    root_cert: Option<&'a str>,
    client_cert: Option<&'a str>,
    client_key: Option<&'a str>,
}

impl<'a> TlsFiles<'a> {
    fn from_config(config: &'a AppConfig) -> Self {
        Self {
            root_cert: config.pg_ssl_root_cert.as_deref(),
            client_cert: config.pg_ssl_cert.as_deref(),
            client_key: config.pg_ssl_key.as_deref(),
        }
    }
}

impl PgEndpoint {
    fn from_config(database_url: &str, config: &AppConfig) -> Result<Self> {
        Self::new(database_url, TlsFiles::from_config(config))
    }

    fn new(database_url: &str, files: TlsFiles<'_>) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid database URL")?;
        let tls = match files.root_cert {
            Some(root) => PgTls::Rustls(MakeRustlsConnect::new(client_tls_config(root, files)?)),
            None => PgTls::None,
        };
        Ok(Self { config, tls })
    }
}

#[derive(Clone)]
pub struct PgConnectionManager {
    endpoint: PgEndpoint,
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = self.endpoint.config.clone();
        match &self.endpoint.tls {
            PgTls::None => {
                let (client, connection) = config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection)
                    .await
                    .map_err(|err| anyhow::anyhow!(err))
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = config.connect(connector.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection)
                    .await
                    .map_err(|err| anyhow::anyhow!(err))
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct ClientConnectionManager {
    endpoint: PgEndpoint,
}

#[async_trait]
impl ManageConnection for ClientConnectionManager {
    type Connection = Client;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = self.endpoint.config.clone();
        match &self.endpoint.tls {
            PgTls::None => {
                let (client, connection) = config.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        error!(error = %err, "query backend connection closed with error");
                    }
                });
                Ok(client)
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = config.connect(connector.clone()).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        error!(error = %err, "query backend connection closed with error");
                    }
                });
                Ok(client)
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}

fn client_tls_config(root_cert: &str, files: TlsFiles<'_>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in read_pem_certs(root_cert, "PGSSLROOTCERT")? {
        roots
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match (files.client_cert, files.client_key) {
        (None, None) => Ok(builder.with_no_client_auth()),
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_pem_certs(cert, "PGSSLCERT")?, read_pem_key(key)?)
            .context("failed to build client TLS config"),
        _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must be set together"),
    }
}

fn read_pem_certs(path: &str, label: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open {label} file '{path}'"))?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse {label}"))?;
    if chain.is_empty() {
        anyhow::bail!("{label} contained no certificates");
    }
    Ok(chain)
}

fn read_pem_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private key")
}
