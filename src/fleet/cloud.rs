//! Lazily provisions workers: builds the signed serverless invocation
//! request and fires it through the loop's HTTP helper. Fire-and-forget;
//! the real success signal is the worker dialling back.

use std::env;
use std::net::{SocketAddr, ToSocketAddrs};

use chrono::{DateTime, Utc};
use hex;
use hmac::{Hmac, Mac};
use serde_json;
use sha2::{Digest, Sha256};

use errors::{Result, ResultExt};
use exec::ExecutionLoop;
use net::connection::ConnectionKind;
use net::http::HttpRequest;

use super::state::WorkerLauncher;

const INVOKE_API_VERSION: &str = "2015-03-31";

pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Credentials from the conventional environment variables.
    pub fn from_env() -> Result<AwsCredentials> {
        Ok(AwsCredentials {
            access_key: env::var("AWS_ACCESS_KEY_ID")
                .chain_err(|| "AWS_ACCESS_KEY_ID is not set")?,
            secret_key: env::var("AWS_SECRET_ACCESS_KEY")
                .chain_err(|| "AWS_SECRET_ACCESS_KEY is not set")?,
            session_token: env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

pub struct CloudConfig {
    /// Region string the invocation endpoint is derived from.
    pub region: String,
    /// Name of the deployed worker function.
    pub function_name: String,
    /// URI of the storage backend, forwarded to every worker.
    pub storage_backend: String,
    pub credentials: AwsCredentials,
}

/// Body of the invocation request; the launched worker reads both fields
/// and dials the coordinator back.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvocationRequest<'a> {
    coordinator: &'a str,
    storage_backend: &'a str,
}

pub struct CloudLauncher {
    config: CloudConfig,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

impl CloudLauncher {
    pub fn new(config: CloudConfig) -> Self {
        CloudLauncher { config }
    }

    pub fn endpoint_host(&self) -> String {
        format!("lambda.{}.amazonaws.com", self.config.region)
    }

    /// The signed invocation request for one new worker. Event invocation
    /// type, function logging disabled.
    pub fn invocation_request(
        &self,
        coordinator: &SocketAddr,
        now: &DateTime<Utc>,
    ) -> Result<HttpRequest> {
        let coordinator = coordinator.to_string();
        let body = serde_json::to_vec(&InvocationRequest {
            coordinator: &coordinator,
            storage_backend: &self.config.storage_backend,
        })?;

        let host = self.endpoint_host();
        let path = format!(
            "/{}/functions/{}/invocations",
            INVOKE_API_VERSION, self.config.function_name
        );
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(&body));

        // kept in lexicographic order; the canonical form requires it
        let mut headers: Vec<(String, String)> = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("host".to_string(), host),
            ("x-amz-date".to_string(), amz_date.clone()),
            ("x-amz-invocation-type".to_string(), "Event".to_string()),
            ("x-amz-log-type".to_string(), "None".to_string()),
        ];
        if let Some(ref token) = self.config.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let canonical_headers: String = headers
            .iter()
            .map(|&(ref name, ref value)| format!("{}:{}\n", name, value))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|&(ref name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "POST\n{}\n\n{}\n{}\n{}",
            path, canonical_headers, signed_headers, payload_hash
        );
        let scope = format!("{}/{}/lambda/aws4_request", date, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let credentials = &self.config.credentials;
        let mut key = hmac_sha256(
            format!("AWS4{}", credentials.secret_key).as_bytes(),
            date.as_bytes(),
        );
        key = hmac_sha256(&key, self.config.region.as_bytes());
        key = hmac_sha256(&key, b"lambda");
        key = hmac_sha256(&key, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            credentials.access_key, scope, signed_headers, signature
        );

        let mut request = HttpRequest::new("POST", &path);
        for (name, value) in headers {
            request = request.header(&name, &value);
        }
        Ok(request.header("authorization", &authorization).body(body))
    }
}

impl WorkerLauncher for CloudLauncher {
    fn launch(&self, exec_loop: &ExecutionLoop, coordinator: &SocketAddr) -> Result<()> {
        let host = self.endpoint_host();
        let addr = match (host.as_str(), 443u16)
            .to_socket_addrs()
            .chain_err(|| format!("cannot resolve {}", host))?
            .next()
        {
            Some(addr) => addr,
            None => bail!("no address for {}", host),
        };
        let request = self.invocation_request(coordinator, &Utc::now())?;
        exec_loop.make_http_request(
            "start-worker",
            &addr,
            ConnectionKind::Tls(host),
            &request,
            Box::new(|_id, _tag, response| {
                info!("invoked a worker (http status {})", response.code)
            }),
            Box::new(|_id, _tag| warn!("worker invocation request failed")),
        )?;
        Ok(())
    }
}
