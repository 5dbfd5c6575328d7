//! SFTP transport for the backup runner. The chosen async SSH/SFTP crates
//! (`russh` + `russh-sftp`) are an implementation detail; the rest of the
//! system only ever sees [`SftpSession`]'s directory-walk and read contract.

use std::{path::Path, sync::Arc, time::Duration};

use ddrive_store::SourceCredentials;
use russh::{client, keys::PrivateKeyWithHashAlg};
use russh_sftp::{client::SftpSession as RusshSftp, protocol::OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::{error::BackupError, progress::RunHandle};

/// Per-task cap on reconnection attempts within a single run.
pub const MAX_RECONNECTS: u32 = 10;
/// Pre-scan's SSH `find`/`stat` probe is abandoned after this long.
pub const PRESCAN_TIMEOUT: Duration = Duration::from_secs(5);
/// How many remote directories the fallback walk and the transfer walk
/// each process concurrently.
pub const WALK_CONCURRENCY: usize = 10;

struct AcceptAllHostKeys;

#[async_trait::async_trait]
impl client::Handler for AcceptAllHostKeys {
	type Error = russh::Error;

	async fn check_server_key(&mut self, _server_public_key: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
		// Host-key pinning is outside this system's scope; the operator supplies credentials
		// for a host they already control.
		Ok(true)
	}
}

#[derive(Debug, Clone)]
pub struct RemoteEntry {
	pub path: String,
	pub is_dir: bool,
	pub size: u64,
}

/// A connected SFTP session plus the credentials needed to reconnect with
/// the same auth mode that worked the first time.
pub struct SftpSession {
	sftp: RusshSftp,
	handle: client::Handle<AcceptAllHostKeys>,
	creds: SourceCredentials,
}

impl SftpSession {
	#[instrument(skip(creds), fields(host = %creds.host, port = creds.port))]
	pub async fn connect(creds: &SourceCredentials) -> Result<Self, BackupError> {
		let config = Arc::new(client::Config::default());
		let mut handle = client::connect(config, (creds.host.as_str(), creds.port), AcceptAllHostKeys)
			.await
			.map_err(BackupError::connect)?;

		let mut authenticated = false;

		// Password first if allowed, then private key, then whatever's
		// available.
		if let Some(password) = &creds.password {
			let password = String::from_utf8_lossy(password).into_owned();
			if handle
				.authenticate_password(&creds.user, password)
				.await
				.map_err(BackupError::connect)?
				.success()
			{
				authenticated = true;
			}
		}

		if !authenticated {
			if let Some(key_bytes) = &creds.private_key {
				let key = russh::keys::decode_secret_key(&String::from_utf8_lossy(key_bytes), None)
					.map_err(BackupError::connect)?;
				let key = PrivateKeyWithHashAlg::new(Arc::new(key), handle.best_supported_rsa_hash().await.ok().flatten());
				if handle
					.authenticate_publickey(&creds.user, key)
					.await
					.map_err(BackupError::connect)?
					.success()
				{
					authenticated = true;
				}
			}
		}

		if !authenticated {
			return Err(BackupError::connect_message(format!(
				"no usable credentials for {}@{}",
				creds.user, creds.host
			)));
		}

		let channel = handle
			.channel_open_session()
			.await
			.map_err(BackupError::connect)?;
		channel
			.request_subsystem(true, "sftp")
			.await
			.map_err(BackupError::connect)?;
		let sftp = RusshSftp::new(channel.into_stream())
			.await
			.map_err(BackupError::connect)?;

		Ok(Self {
			sftp,
			handle,
			creds: creds.clone(),
		})
	}

	/// Re-establish the connection using the same credentials that
	/// succeeded originally.
	pub async fn reconnect(&mut self) -> Result<(), BackupError> {
		let fresh = Self::connect(&self.creds).await?;
		self.sftp = fresh.sftp;
		self.handle = fresh.handle;
		Ok(())
	}

	/// Try the SSH exec pre-scan (`find … -type f -exec stat -c %s`); `None`
	/// if the exec channel isn't usable or times out, so the caller can fall
	/// back to [`walk_for_prescan`].
	pub async fn exec_prescan(&mut self, remote_dir: &str) -> Option<(u64, u64)> {
		let cmd = format!("find {remote_dir} -type f -exec stat -c %s {{}} +");
		match tokio::time::timeout(PRESCAN_TIMEOUT, self.run_exec(&cmd)).await {
			Ok(Ok(output)) => {
				let mut total_files = 0u64;
				let mut total_bytes = 0u64;
				for line in output.lines() {
					if let Ok(size) = line.trim().parse::<u64>() {
						total_files += 1;
						total_bytes += size;
					}
				}
				Some((total_files, total_bytes))
			}
			_ => None,
		}
	}

	async fn run_exec(&mut self, cmd: &str) -> Result<String, BackupError> {
		use russh::ChannelMsg;

		let mut channel = self
			.handle
			.channel_open_session()
			.await
			.map_err(BackupError::sftp)?;
		channel
			.exec(true, cmd)
			.await
			.map_err(BackupError::sftp)?;

		let mut output = Vec::new();
		loop {
			match channel.wait().await {
				Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
				Some(ChannelMsg::ExitStatus { exit_status }) if exit_status != 0 => {
					return Err(BackupError::sftp_message(format!("exec exited with status {exit_status}")));
				}
				Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
				_ => {}
			}
		}
		Ok(String::from_utf8_lossy(&output).into_owned())
	}

	/// List the immediate children of `remote_dir`, skipping any entry
	/// whose name matches a case-insensitive `excludePaths` segment.
	pub async fn list_dir(&self, remote_dir: &str, exclude: &[String]) -> Result<Vec<RemoteEntry>, BackupError> {
		let entries = self
			.sftp
			.read_dir(remote_dir)
			.await
			.map_err(BackupError::sftp)?;

		let mut out = Vec::new();
		for entry in entries {
			let name = entry.file_name();
			if name == "." || name == ".." {
				continue;
			}
			if exclude.iter().any(|seg| seg.eq_ignore_ascii_case(&name)) {
				debug!(path = %name, "skipping excluded path");
				continue;
			}
			let meta = entry.metadata();
			let full = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
			out.push(RemoteEntry {
				path: full,
				is_dir: meta.is_dir(),
				size: meta.size.unwrap_or(0),
			});
		}
		Ok(out)
	}

	pub async fn download_to_path(&self, remote_path: &str, local_path: &Path) -> Result<u64, BackupError> {
		let mut remote = self
			.sftp
			.open_with_flags(remote_path, OpenFlags::READ)
			.await
			.map_err(BackupError::sftp)?;
		let mut local = tokio::fs::File::create(local_path).await?;
		let mut buf = vec![0u8; 256 * 1024];
		let mut total = 0u64;
		loop {
			let n = remote.read(&mut buf).await.map_err(BackupError::sftp)?;
			if n == 0 {
				break;
			}
			local.write_all(&buf[..n]).await?;
			total += n as u64;
		}
		Ok(total)
	}

	pub async fn download_to_memory(&self, remote_path: &str) -> Result<Vec<u8>, BackupError> {
		let mut remote = self
			.sftp
			.open_with_flags(remote_path, OpenFlags::READ)
			.await
			.map_err(BackupError::sftp)?;
		let mut buf = Vec::new();
		remote.read_to_end(&mut buf).await.map_err(BackupError::sftp)?;
		Ok(buf)
	}
}

/// Run `op`, reconnecting and retrying up to [`MAX_RECONNECTS`] times if it
/// fails with a reconnection-eligible error. Any other error, or exhaustion
/// of the cap, is returned to the caller, who logs and skips the item
/// rather than aborting the whole run. The cancel flag is checked before
/// the call and before every retry, so a cancelled run doesn't keep
/// reconnecting.
pub async fn with_reconnect<F, Fut, T>(
	session: &mut SftpSession,
	reconnects: &mut u32,
	run: &RunHandle,
	mut op: F,
) -> Result<T, BackupError>
where
	F: FnMut(&SftpSession) -> Fut,
	Fut: std::future::Future<Output = Result<T, BackupError>>,
{
	loop {
		run.check_cancelled()?;
		match op(session).await {
			Ok(value) => return Ok(value),
			Err(err) if err.is_reconnect_eligible() => {
				if *reconnects >= MAX_RECONNECTS {
					return Err(BackupError::SftpExhausted(err.to_string()));
				}
				*reconnects += 1;
				warn!(attempt = *reconnects, %err, "reconnecting to sftp source");
				run.check_cancelled()?;
				session.reconnect().await?;
			}
			Err(err) => return Err(err),
		}
	}
}

/// Fallback pre-scan: when the SSH `find`/`stat` exec probe is
/// unavailable, walk the tree via plain SFTP directory listings, `
/// WALK_CONCURRENCY` directories at a time.
pub async fn walk_for_prescan(
	session: &SftpSession,
	root: &str,
	exclude: &[String],
) -> Result<(u64, u64), BackupError> {
	let mut pending = vec![root.to_string()];
	let mut total_files = 0u64;
	let mut total_bytes = 0u64;

	while !pending.is_empty() {
		let batch: Vec<_> = pending.drain(..pending.len().min(WALK_CONCURRENCY)).collect();
		let results = futures::future::join_all(batch.iter().map(|dir| session.list_dir(dir, exclude))).await;
		for result in results {
			for entry in result? {
				if entry.is_dir {
					pending.push(entry.path);
				} else {
					total_files += 1;
					total_bytes += entry.size;
				}
			}
		}
	}

	Ok((total_files, total_bytes))
}
