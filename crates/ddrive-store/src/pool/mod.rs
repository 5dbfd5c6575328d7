use std::time::Duration;

use miette::{IntoDiagnostic, Result, WrapErr};
use mobc::Pool;
use tokio_postgres::config::SslMode;
use tracing::debug;

pub use manager::{PgConnectionManager, PgError};

mod manager;
mod tls;
mod url;

pub type PgConnection = mobc::Connection<PgConnectionManager>;

#[derive(Clone)]
pub struct PgPool {
	inner: Pool<PgConnectionManager>,
}

impl PgPool {
	/// Returns a single connection, either opening a new one or reusing an
	/// existing one from the pool. Blocks until a connection is returned or
	/// the pool's configured timeout elapses.
	pub async fn get(&self) -> Result<PgConnection, mobc::Error<PgError>> {
		self.inner.get().await
	}

	/// As [`Self::get`], but with an explicit timeout overriding the pool
	/// default. The copy transaction uses this with a 120s budget
	/// since it performs blob I/O while the transaction is open.
	pub async fn get_timeout(&self, duration: Duration) -> Result<PgConnection, mobc::Error<PgError>> {
		self.inner.get_timeout(duration).await
	}
}

/// Create a connection pool from a `postgresql://` connection URL.
///
/// Supports Unix socket connections via an empty host (auto-detects) or a
/// percent-encoded Unix socket path, exactly as the pool this was adapted
/// from; unlike that original, this pool never prompts interactively for a
/// password — in server context there is nobody at a terminal to ask, so an
/// auth failure is returned to the caller immediately.
pub async fn create_pool(url: &str, application_name: &str) -> Result<PgPool> {
	let mut config = url::parse_connection_url(url)?;
	config.application_name(application_name);

	let use_tls = config.get_ssl_mode() != SslMode::Disable;
	let manager = PgConnectionManager::new(config, use_tls);

	debug!(application_name, use_tls, "building postgres pool");
	let pool = Pool::builder()
		.max_lifetime(Some(Duration::from_secs(3600)))
		.build(manager);

	let pool = PgPool { inner: pool };

	check_pool(&pool).await.wrap_err("checking pool connectivity")?;
	Ok(pool)
}

async fn check_pool(pool: &PgPool) -> Result<()> {
	let conn = pool.get().await.into_diagnostic()?;
	conn.simple_query("SELECT 1").await.into_diagnostic()?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn rejects_unparseable_url() {
		let result = create_pool("not a url", "test").await;
		assert!(result.is_err());
	}
}
