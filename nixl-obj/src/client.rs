//! Object-store client seam.
//!
//! The engine talks to the store through [`ObjectClient`] so tests can
//! inject a mock; the production implementation wraps an S3-compatible
//! client and runs every operation (and its completion callback) on the
//! engine's thread-pool executor.

use std::collections::HashMap;
use std::sync::Arc;

use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use log::{info, warn};
use parking_lot::Mutex;

use nixl_core::{EngineError, Result};

use crate::executor::ThreadPoolExecutor;

pub const BUCKET_ENV: &str = "AWS_DEFAULT_BUCKET";

pub type ObjCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Async PUT/GET against a key-addressed store. `offset` is a byte offset
/// within the object; callbacks run on the executor and receive the
/// operation outcome.
pub trait ObjectClient: Send + Sync {
    fn set_executor(&self, executor: Arc<ThreadPoolExecutor>);

    fn put_async(&self, key: &str, data_ptr: u64, data_len: usize, offset: u64, cb: ObjCallback);

    fn get_async(&self, key: &str, data_ptr: u64, data_len: usize, offset: u64, cb: ObjCallback);
}

/// Production client over an S3-compatible endpoint.
pub struct S3ObjectClient {
    client: aws_sdk_s3::Client,
    bucket: String,
    runtime: tokio::runtime::Runtime,
    executor: Mutex<Option<Arc<ThreadPoolExecutor>>>,
}

impl std::fmt::Debug for S3ObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectClient").finish()
    }
}

impl S3ObjectClient {
    /// Builds the client from the backend parameter map: `endpoint_override`,
    /// `scheme` (`http`/`https`), `region`, `access_key`/`secret_key`/
    /// `session_token`, `use_virtual_addressing`, and `bucket` (falling back
    /// to `AWS_DEFAULT_BUCKET`).
    pub fn from_params(
        params: &HashMap<String, String>,
        executor: Arc<ThreadPoolExecutor>,
    ) -> Result<Self> {
        let scheme = match params.get("scheme").map(String::as_str) {
            None => "https",
            Some(scheme @ ("http" | "https")) => scheme,
            Some(other) => {
                return Err(EngineError::invalid(format!("invalid scheme: {other}")));
            }
        };

        let endpoint_url = params.get("endpoint_override").map(|endpoint| {
            if endpoint.contains("://") {
                endpoint.clone()
            } else {
                format!("{scheme}://{endpoint}")
            }
        });

        let credentials = match (
            params.get("access_key").filter(|key| !key.is_empty()),
            params.get("secret_key").filter(|key| !key.is_empty()),
        ) {
            (Some(access_key), Some(secret_key)) => {
                let session_token = params
                    .get("session_token")
                    .filter(|token| !token.is_empty())
                    .cloned();
                Some(Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    session_token,
                    None,
                    "backend-params",
                ))
            }
            // Both keys empty means the default credential resolver.
            _ => None,
        };

        let use_virtual_addressing = match params.get("use_virtual_addressing").map(String::as_str)
        {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(EngineError::invalid(format!(
                    "invalid value for use_virtual_addressing: '{other}'. Must be 'true' or 'false'"
                )));
            }
        };

        let bucket = params
            .get("bucket")
            .filter(|bucket| !bucket.is_empty())
            .cloned()
            .or_else(|| std::env::var(BUCKET_ENV).ok().filter(|bucket| !bucket.is_empty()))
            .ok_or_else(|| {
                EngineError::invalid(format!(
                    "bucket name not found: provide 'bucket' or set {BUCKET_ENV}"
                ))
            })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("nixl-obj-s3")
            .enable_all()
            .build()
            .map_err(|err| EngineError::backend(format!("runtime setup failed: {err}")))?;

        let region = params.get("region").cloned();
        let client = runtime.block_on(async move {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = region {
                loader = loader.region(aws_sdk_s3::config::Region::new(region));
            }
            let sdk_config = loader.load().await;

            let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(!use_virtual_addressing);
            if let Some(url) = endpoint_url {
                builder = builder.endpoint_url(url);
            }
            if let Some(credentials) = credentials {
                builder =
                    builder.credentials_provider(SharedCredentialsProvider::new(credentials));
            }
            aws_sdk_s3::Client::from_conf(builder.build())
        });

        info!("object client targeting bucket {bucket}");
        Ok(Self {
            client,
            bucket,
            runtime,
            executor: Mutex::new(Some(executor)),
        })
    }

    fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let executor = self.executor.lock().clone();
        match executor {
            Some(executor) => executor.submit(job),
            None => {
                warn!("object client has no executor; running operation inline");
                job();
            }
        }
    }
}

impl ObjectClient for S3ObjectClient {
    fn set_executor(&self, executor: Arc<ThreadPoolExecutor>) {
        *self.executor.lock() = Some(executor);
    }

    fn put_async(&self, key: &str, data_ptr: u64, data_len: usize, offset: u64, cb: ObjCallback) {
        // The store has no partial-object PUT.
        if offset != 0 {
            warn!("PUT at non-zero offset {offset} is not supported");
            cb(false);
            return;
        }

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        let handle = self.runtime.handle().clone();

        self.submit(move || {
            // SAFETY: the pointer/length pair comes from a registration that
            // stays valid until the transfer completes; no copy is made.
            let body: &'static [u8] =
                unsafe { std::slice::from_raw_parts(data_ptr as *const u8, data_len) };
            let outcome = handle.block_on(async {
                client
                    .put_object()
                    .bucket(&bucket)
                    .key(&key)
                    .body(ByteStream::from_static(body))
                    .send()
                    .await
            });
            let ok = match outcome {
                Ok(_) => true,
                Err(err) => {
                    warn!("PUT {key} failed: {err}");
                    false
                }
            };
            cb(ok);
        });
    }

    fn get_async(&self, key: &str, data_ptr: u64, data_len: usize, offset: u64, cb: ObjCallback) {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        let handle = self.runtime.handle().clone();
        let range =
            (offset > 0).then(|| format!("bytes={}-{}", offset, offset + data_len as u64 - 1));

        self.submit(move || {
            let ok = handle.block_on(async {
                let mut request = client.get_object().bucket(&bucket).key(&key);
                if let Some(range) = range {
                    request = request.range(range);
                }
                match request.send().await {
                    Ok(resp) => match resp.body.collect().await {
                        Ok(data) => {
                            let bytes = data.into_bytes();
                            let copied = bytes.len().min(data_len);
                            // SAFETY: the destination registration covers
                            // `data_len` bytes and outlives the transfer.
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    bytes.as_ptr(),
                                    data_ptr as *mut u8,
                                    copied,
                                );
                            }
                            true
                        }
                        Err(err) => {
                            warn!("GET {key} body read failed: {err}");
                            false
                        }
                    },
                    Err(err) => {
                        warn!("GET {key} failed: {err}");
                        false
                    }
                }
            });
            cb(ok);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn invalid_scheme_is_rejected() {
        let executor = ThreadPoolExecutor::new(1);
        let err = S3ObjectClient::from_params(
            &params(&[("scheme", "ftp"), ("bucket", "b")]),
            executor,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid scheme"));
    }

    #[test]
    fn invalid_virtual_addressing_literal_is_rejected() {
        let executor = ThreadPoolExecutor::new(1);
        let err = S3ObjectClient::from_params(
            &params(&[("use_virtual_addressing", "yes"), ("bucket", "b")]),
            executor,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn missing_bucket_fails_construction() {
        if std::env::var_os(BUCKET_ENV).is_some() {
            // Environment provides a fallback; nothing to assert here.
            return;
        }
        let executor = ThreadPoolExecutor::new(1);
        let err = S3ObjectClient::from_params(&params(&[]), executor).unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn explicit_config_constructs() {
        let executor = ThreadPoolExecutor::new(1);
        let client = S3ObjectClient::from_params(
            &params(&[
                ("endpoint_override", "localhost:9000"),
                ("scheme", "http"),
                ("region", "us-east-1"),
                ("access_key", "minio"),
                ("secret_key", "minio123"),
                ("use_virtual_addressing", "false"),
                ("bucket", "test-bucket"),
            ]),
            executor,
        )
        .expect("client construction");
        assert_eq!(client.bucket, "test-bucket");
    }
}
