use thiserror::Error;
use tokio_postgres::{Client, Config, Connection, Socket};
use tracing::error;

use super::tls;

#[derive(Debug, Error)]
pub enum PgError {
	#[error("connecting: {0}")]
	Connect(#[from] tokio_postgres::Error),

	#[error("building tls config: {0}")]
	Tls(String),
}

/// A [`mobc::Manager`] that opens a fresh `tokio_postgres` connection per
/// pooled slot, over rustls TLS when the connection's `sslmode` calls for
/// it. Connections are spawned onto their own task, mirroring the pattern
/// required by `tokio_postgres::Client`: the `Connection` future must be
/// driven concurrently with the `Client`.
#[derive(Clone)]
pub struct PgConnectionManager {
	config: Config,
	use_tls: bool,
}

impl PgConnectionManager {
	pub fn new(config: Config, use_tls: bool) -> Self {
		Self { config, use_tls }
	}
}

#[mobc::async_trait]
impl mobc::Manager for PgConnectionManager {
	type Connection = Client;
	type Error = PgError;

	async fn connect(&self) -> Result<Self::Connection, Self::Error> {
		if self.use_tls {
			let connector = tls::make_connector().map_err(|e| PgError::Tls(e.to_string()))?;
			let (client, connection) = self.config.connect(connector).await?;
			spawn_connection(connection);
			Ok(client)
		} else {
			let (client, connection) = self.config.connect(tokio_postgres::NoTls).await?;
			spawn_connection(connection);
			Ok(client)
		}
	}

	async fn check(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
		conn.simple_query("SELECT 1").await?;
		Ok(conn)
	}
}

fn spawn_connection<S>(connection: Connection<Socket, S>)
where
	S: tokio_postgres::tls::TlsStream + Unpin + Send + 'static,
{
	tokio::spawn(async move {
		if let Err(err) = connection.await {
			error!("postgres connection error: {err}");
		}
	});
}
