#![deny(rust_2018_idioms)]

//! A blob adapter over a single fixed channel on an external chat service
//!. Every stored byte-blob is one attachment on one message; the
//! adapter's job is to hide the chat service's REST surface behind three
//! operations and to surface rate limits and size limits structurally
//! rather than as opaque failures.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// The chat service's per-attachment maximum. Chunks must never exceed this
/// after encryption overhead.
pub const DISCORD_MAX: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BlobError {
	#[error("blob exceeds substrate maximum of {max} bytes")]
	TooLarge { max: u64 },

	#[error("rate limited, retry after {retry_after:?}")]
	RateLimit { retry_after: Duration },

	#[error("blob not found")]
	NotFound,

	#[error("network error talking to blob substrate: {0}")]
	Net(#[from] reqwest::Error),

	#[error("unexpected status {0} from blob substrate")]
	UnexpectedStatus(StatusCode),
}

/// Where a stored blob lives: one message, one attachment, on the fixed
/// target channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
	pub message_id: String,
	pub channel_id: String,
	pub url: String,
}

/// A single attachment message returned by the paging sweep the reconciler
/// uses to enumerate every blob currently stored.
#[derive(Debug, Clone)]
pub struct MessageSummary {
	pub message_id: String,
	pub channel_id: String,
}

#[async_trait]
pub trait BlobAdapter: Send + Sync {
	/// Publish `bytes` as one attachment named `name`, returning its
	/// location. Fails with [`BlobError::TooLarge`] if `bytes` exceeds
	/// [`DISCORD_MAX`] before even attempting the request.
	async fn put(&self, name: &str, bytes: Bytes) -> Result<BlobLocation, BlobError>;

	/// Fetch the attachment bytes for a `(message_id, channel_id)` pair.
	async fn get(&self, message_id: &str, channel_id: &str) -> Result<Bytes, BlobError>;

	/// Delete a message. Idempotent: a not-found delete is success.
	async fn delete(&self, message_id: &str, channel_id: &str) -> Result<(), BlobError>;

	/// Page the target channel's message history, oldest-referenceable
	/// first is not guaranteed; the reconciler pages backwards from
	/// `before` (a message id) collecting up to `limit` summaries per call.
	async fn list_messages(
		&self,
		before: Option<&str>,
		limit: u32,
	) -> Result<Vec<MessageSummary>, BlobError>;
}

/// A `BlobAdapter` over a chat service's REST API, scoped to one fixed
/// channel identified at construction time.
pub struct ChatAttachmentClient {
	http: Client,
	base_url: String,
	channel_id: String,
	token: String,
}

impl ChatAttachmentClient {
	pub fn new(base_url: impl Into<String>, channel_id: impl Into<String>, token: impl Into<String>) -> Self {
		Self {
			http: Client::new(),
			base_url: base_url.into(),
			channel_id: channel_id.into(),
			token: token.into(),
		}
	}

	fn messages_url(&self) -> String {
		format!("{}/channels/{}/messages", self.base_url, self.channel_id)
	}

	fn message_url(&self, message_id: &str) -> String {
		format!("{}/{message_id}", self.messages_url())
	}

	fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<BlobError> {
		match status {
			StatusCode::NOT_FOUND => Some(BlobError::NotFound),
			StatusCode::TOO_MANY_REQUESTS => Some(BlobError::RateLimit {
				retry_after: retry_after.unwrap_or(Duration::from_secs(1)),
			}),
			s if s.is_success() => None,
			s => Some(BlobError::UnexpectedStatus(s)),
		}
	}
}

fn retry_after_from_headers(resp: &reqwest::Response) -> Option<Duration> {
	resp.headers()
		.get("retry-after")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<f64>().ok())
		.map(Duration::from_secs_f64)
}

#[derive(Deserialize)]
struct MessageEnvelope {
	id: String,
	attachments: Vec<AttachmentEnvelope>,
}

#[derive(Deserialize)]
struct AttachmentEnvelope {
	url: String,
}

#[async_trait]
impl BlobAdapter for ChatAttachmentClient {
	#[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
	async fn put(&self, name: &str, bytes: Bytes) -> Result<BlobLocation, BlobError> {
		if bytes.len() as u64 > DISCORD_MAX {
			return Err(BlobError::TooLarge { max: DISCORD_MAX });
		}

		let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(name.to_string());
		let form = reqwest::multipart::Form::new().part("files[0]", part);

		debug!(name, "uploading blob");
		let resp = self
			.http
			.post(self.messages_url())
			.bearer_auth(&self.token)
			.multipart(form)
			.send()
			.await?;

		let status = resp.status();
		let retry_after = retry_after_from_headers(&resp);
		if let Some(err) = Self::classify_status(status, retry_after) {
			return Err(err);
		}

		let envelope: MessageEnvelope = resp.json().await?;
		let attachment = envelope
			.attachments
			.into_iter()
			.next()
			.ok_or(BlobError::NotFound)?;

		Ok(BlobLocation {
			message_id: envelope.id,
			channel_id: self.channel_id.clone(),
			url: attachment.url,
		})
	}

	#[instrument(skip(self))]
	async fn get(&self, message_id: &str, channel_id: &str) -> Result<Bytes, BlobError> {
		let resp = self
			.http
			.get(self.message_url(message_id))
			.bearer_auth(&self.token)
			.send()
			.await?;

		let status = resp.status();
		let retry_after = retry_after_from_headers(&resp);
		if let Some(err) = Self::classify_status(status, retry_after) {
			return Err(err);
		}

		let envelope: MessageEnvelope = resp.json().await?;
		let attachment = envelope
			.attachments
			.into_iter()
			.next()
			.ok_or(BlobError::NotFound)?;

		debug!(channel_id, "fetching attachment body");
		let bytes = self.http.get(&attachment.url).send().await?.bytes().await?;
		Ok(bytes)
	}

	#[instrument(skip(self))]
	async fn delete(&self, message_id: &str, channel_id: &str) -> Result<(), BlobError> {
		let resp = self
			.http
			.delete(self.message_url(message_id))
			.bearer_auth(&self.token)
			.send()
			.await?;

		let status = resp.status();
		if status == StatusCode::NOT_FOUND {
			debug!(channel_id, message_id, "delete target already gone, treating as success");
			return Ok(());
		}
		let retry_after = retry_after_from_headers(&resp);
		if let Some(err) = Self::classify_status(status, retry_after) {
			warn!(?err, message_id, "blob delete failed");
			return Err(err);
		}
		Ok(())
	}

	#[instrument(skip(self))]
	async fn list_messages(
		&self,
		before: Option<&str>,
		limit: u32,
	) -> Result<Vec<MessageSummary>, BlobError> {
		let mut req = self
			.http
			.get(self.messages_url())
			.bearer_auth(&self.token)
			.query(&[("limit", limit.to_string())]);
		if let Some(before) = before {
			req = req.query(&[("before", before)]);
		}

		let resp = req.send().await?;
		let status = resp.status();
		let retry_after = retry_after_from_headers(&resp);
		if let Some(err) = Self::classify_status(status, retry_after) {
			return Err(err);
		}

		let envelopes: Vec<MessageEnvelope> = resp.json().await?;
		Ok(envelopes
			.into_iter()
			.map(|e| MessageSummary {
				message_id: e.id,
				channel_id: self.channel_id.clone(),
			})
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_oversize_put_before_sending() {
		let client = ChatAttachmentClient::new("http://localhost", "chan", "token");
		let bytes = Bytes::from(vec![0u8; (DISCORD_MAX + 1) as usize]);
		let result = tokio_test_block_on(client.put("x", bytes));
		assert!(matches!(result, Err(BlobError::TooLarge { .. })));
	}

	fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
		tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.unwrap()
			.block_on(f)
	}
}
