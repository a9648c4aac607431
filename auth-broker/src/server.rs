// auth-broker/src/server.rs
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use actix_web::{web, App, HttpServer};

use common::config::{BrokerConfig, SslConfig};
use common::error::ConfigError;
use common::utils::setup_tracing;

use crate::chain::RecordRegistry;
use crate::dispatcher::BrokerCore;
use crate::hooks::AuthHooks;
use crate::routing::routes;

/// The embeddable broker. Construction validates the closed-set options;
/// `run` binds the listener and serves until shutdown.
pub struct Broker {
    core: Arc<BrokerCore>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        records: Arc<dyn RecordRegistry>,
        hooks: Arc<dyn AuthHooks>,
    ) -> Result<Self, ConfigError> {
        let core = BrokerCore::new(config, records, hooks)?;
        Ok(Self {
            core: Arc::new(core),
        })
    }

    /// Shared state handle, mainly for embedders that add their own routes.
    pub fn core(&self) -> Arc<BrokerCore> {
        self.core.clone()
    }

    /// Bind the listener (TLS when material is configured, plaintext
    /// otherwise) and serve.
    pub async fn run(self) -> io::Result<()> {
        if self.core.config.debug {
            setup_tracing(true);
        }

        let port = self.core.config.port;
        let core = self.core.clone();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::from(core.clone()))
                .configure(routes)
        });

        let server = match &self.core.config.ssl {
            Some(ssl) => {
                let tls = load_rustls_config(ssl)?;
                tracing::info!("Starting broker with TLS on port {}", port);
                server.bind_rustls_0_23(("0.0.0.0", port), tls)?
            }
            None => {
                tracing::info!("Starting broker on port {}", port);
                server.bind(("0.0.0.0", port))?
            }
        };

        server.run().await
    }
}

fn load_rustls_config(ssl: &SslConfig) -> io::Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&ssl.cert)?))
        .collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&ssl.key)?))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key in PEM file"))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))
}
