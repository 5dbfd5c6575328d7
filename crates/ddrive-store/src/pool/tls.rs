use miette::Result;
use rustls::{ClientConfig, RootCertStore};

/// Build a rustls client config trusting the platform's native certificate
/// store. TLS is negotiated or skipped per-connection based on the
/// connection's `sslmode`; this config is shared across the pool.
pub fn client_config() -> Result<ClientConfig> {
	let mut roots = RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = roots.add(cert);
	}

	Ok(ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth())
}

pub fn make_connector() -> Result<tokio_postgres_rustls::MakeRustlsConnect> {
	Ok(tokio_postgres_rustls::MakeRustlsConnect::new(
		client_config()?,
	))
}
