use std::sync::OnceLock;
use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use dashmap::DashMap;
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::Signer;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;
use url::Url;

use super::payload::{MAX_PAYLOAD_BYTES, truncate_string};
use super::{DeliveryClient, DeliveryError, PushMessage};
use crate::database::models::SubscriptionDescriptor;
use crate::{Error, Result};

const SALT_LEN: usize = 16;
const PUBLIC_KEY_LEN: usize = 65;
const AUTH_SECRET_LEN: usize = 16;
const DEFAULT_RS: u32 = 4096;
const MESSAGE_TTL_SECS: &str = "3600";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_INLINE_RETRY_AFTER: Duration = Duration::from_secs(30);
const VAPID_JWT_EXP_SECS: i64 = 12 * 60 * 60;
const VAPID_JWT_SKEW_SECS: i64 = 60;
const DEFAULT_VAPID_SUBJECT: &str = "mailto:admin@localhost";

const IKM_INFO_PREFIX: &str = "WebPush: info\0";
const KEY_INFO: &str = "Content-Encoding: aes128gcm\0";
const NONCE_INFO: &str = "Content-Encoding: nonce\0";

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Debug, Clone)]
struct CachedVapidJwt {
    jwt: String,
    exp_unix: i64,
}

#[derive(Debug, Clone)]
pub struct WebPushConfig {
    vapid_public_key_b64: String,
    vapid_private_key_raw: [u8; 32],
    vapid_subject: String,
}

impl WebPushConfig {
    /// `Ok(None)` when neither VAPID key is configured.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let (public, private) = match (
            get("WEB_PUSH_VAPID_PUBLIC_KEY"),
            get("WEB_PUSH_VAPID_PRIVATE_KEY"),
        ) {
            (None, None) => return Ok(None),
            (Some(public), Some(private)) => (public, private),
            _ => {
                return Err(Error::config(
                    "Both WEB_PUSH_VAPID_PUBLIC_KEY and WEB_PUSH_VAPID_PRIVATE_KEY must be set",
                ));
            }
        };
        let subject =
            get("WEB_PUSH_VAPID_SUBJECT").unwrap_or_else(|| DEFAULT_VAPID_SUBJECT.to_string());

        Self::from_keys(&public, &private, &subject).map(Some)
    }

    /// Validate a base64url VAPID key pair.
    pub fn from_keys(public_b64: &str, private_b64: &str, subject: &str) -> Result<Self> {
        let public_raw = decode_b64url(public_b64)
            .map_err(|e| Error::config(format!("Invalid WEB_PUSH_VAPID_PUBLIC_KEY: {}", e)))?;
        let private_raw = decode_b64url(private_b64)
            .map_err(|e| Error::config(format!("Invalid WEB_PUSH_VAPID_PRIVATE_KEY: {}", e)))?;

        if public_raw.len() != PUBLIC_KEY_LEN {
            return Err(Error::config(format!(
                "WEB_PUSH_VAPID_PUBLIC_KEY must decode to {} bytes",
                PUBLIC_KEY_LEN
            )));
        }
        let private_raw: [u8; 32] = private_raw
            .try_into()
            .map_err(|_| Error::config("WEB_PUSH_VAPID_PRIVATE_KEY must decode to 32 bytes"))?;
        SigningKey::from_bytes((&private_raw).into())
            .map_err(|_| Error::config("WEB_PUSH_VAPID_PRIVATE_KEY is not a valid P-256 key"))?;

        Ok(Self {
            vapid_public_key_b64: public_b64.to_string(),
            vapid_private_key_raw: private_raw,
            vapid_subject: subject.to_string(),
        })
    }

    pub fn vapid_public_key_b64(&self) -> &str {
        &self.vapid_public_key_b64
    }
}

/// [`DeliveryClient`] speaking the Web Push protocol (RFC 8030/8291/8292).
#[derive(Debug)]
pub struct WebPushClient {
    config: WebPushConfig,
    client: reqwest::Client,
    vapid_jwt_cache: DashMap<String, CachedVapidJwt>,
}

impl WebPushClient {
    pub fn new(config: WebPushConfig) -> Result<Self> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Other(format!("Failed to build reqwest client: {}", e)))?;
        Ok(Self {
            config,
            client,
            vapid_jwt_cache: DashMap::new(),
        })
    }

    pub fn from_env() -> Result<Option<Self>> {
        let Some(config) = WebPushConfig::from_env()? else {
            return Ok(None);
        };
        Ok(Some(Self::new(config)?))
    }

    pub fn vapid_public_key(&self) -> &str {
        self.config.vapid_public_key_b64()
    }

    async fn post(
        &self,
        endpoint: &str,
        body: Vec<u8>,
        authorization: &str,
    ) -> std::result::Result<reqwest::Response, DeliveryError> {
        self.client
            .post(endpoint)
            .header("TTL", MESSAGE_TTL_SECS)
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .header("Authorization", authorization)
            .header("Urgency", "normal")
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("Web push request failed: {}", e)))
    }

    fn get_or_build_vapid_jwt(&self, aud: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        if let Some(entry) = self.vapid_jwt_cache.get(aud)
            && entry.exp_unix - VAPID_JWT_SKEW_SECS > now
        {
            return Ok(entry.jwt.clone());
        }

        let (jwt, exp_unix) = build_vapid_jwt_with_exp(
            aud,
            &self.config.vapid_subject,
            &self.config.vapid_private_key_raw,
            VAPID_JWT_EXP_SECS,
        )?;
        self.vapid_jwt_cache.insert(
            aud.to_string(),
            CachedVapidJwt {
                jwt: jwt.clone(),
                exp_unix,
            },
        );
        Ok(jwt)
    }
}

#[async_trait]
impl DeliveryClient for WebPushClient {
    async fn send(
        &self,
        subscription: &SubscriptionDescriptor,
        message: &PushMessage,
    ) -> std::result::Result<(), DeliveryError> {
        let aud = push_service_audience(&subscription.endpoint)
            .map_err(|e| DeliveryError::InvalidSubscription(e.to_string()))?;
        let (client_pub, client_auth) = parse_client_keys(subscription)?;

        let jwt = self
            .get_or_build_vapid_jwt(&aud)
            .map_err(|e| DeliveryError::transient(e.to_string()))?;
        let payload = message
            .to_bytes_capped(MAX_PAYLOAD_BYTES)
            .map_err(|e| DeliveryError::transient(format!("Payload serialization failed: {}", e)))?;
        let body = encrypt_aes128gcm(&payload, &client_pub, &client_auth)
            .map_err(|e| DeliveryError::transient(e.to_string()))?;
        let authorization = format!("vapid t={}, k={}", jwt, self.config.vapid_public_key_b64);

        let mut response = self
            .post(&subscription.endpoint, body.clone(), &authorization)
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS
            && let Some(delay) = retry_after_delay(&response)
            && delay <= MAX_INLINE_RETRY_AFTER
        {
            debug!(
                endpoint = %subscription.endpoint,
                delay_secs = delay.as_secs(),
                "Push service throttled; retrying once"
            );
            tokio::time::sleep(delay).await;
            response = self
                .post(&subscription.endpoint, body, &authorization)
                .await?;
        }

        classify_response(response).await
    }
}

async fn classify_response(
    response: reqwest::Response,
) -> std::result::Result<(), DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(DeliveryError::Gone {
            status: status.as_u16(),
        });
    }

    let body_text = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read response body>".to_string());
    Err(DeliveryError::Transient(format!(
        "Web push failed: status {} body {}",
        status,
        truncate_string(&body_text, 500)
    )))
}

fn parse_client_keys(
    subscription: &SubscriptionDescriptor,
) -> std::result::Result<(p256::PublicKey, [u8; AUTH_SECRET_LEN]), DeliveryError> {
    let invalid = |msg: String| DeliveryError::InvalidSubscription(msg);

    let client_pub_raw =
        decode_b64url(&subscription.p256dh).map_err(|e| invalid(format!("p256dh: {}", e)))?;
    let client_auth =
        decode_b64url(&subscription.auth).map_err(|e| invalid(format!("auth: {}", e)))?;
    if client_pub_raw.len() != PUBLIC_KEY_LEN {
        return Err(invalid("p256dh key length".to_string()));
    }
    let client_pub = p256::PublicKey::from_sec1_bytes(&client_pub_raw)
        .map_err(|_| invalid("p256dh is not a P-256 point".to_string()))?;
    let client_auth: [u8; AUTH_SECRET_LEN] = client_auth
        .try_into()
        .map_err(|_| invalid("auth secret length".to_string()))?;

    Ok((client_pub, client_auth))
}

/// `scheme://host[:port]` of the push endpoint, used as the VAPID `aud`.
fn push_service_audience(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::Other(format!("Invalid push endpoint URL: {}", e)))?;
    let host = url
        .host()
        .ok_or_else(|| Error::Other("Push endpoint missing host".to_string()))?;

    let host = match host {
        url::Host::Domain(d) => d.to_string(),
        url::Host::Ipv4(ip) => ip.to_string(),
        url::Host::Ipv6(ip) => format!("[{}]", ip),
    };

    let aud = match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };
    Ok(aud)
}

fn retry_after_delay(response: &reqwest::Response) -> Option<Duration> {
    let value = response.headers().get("Retry-After")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}

fn decode_b64url(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.trim_end_matches('=').as_bytes())
}

fn encode_b64url(input: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(input)
}

fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::Other("HKDF expand failed".to_string()))?;
    Ok(okm)
}

/// Single-record `aes128gcm` body: header (salt, rs, keyid) followed by ciphertext.
fn encrypt_aes128gcm(
    plaintext: &[u8],
    remote_pub: &p256::PublicKey,
    auth_secret: &[u8; AUTH_SECRET_LEN],
) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(Error::Other("Web push payload cannot be empty".to_string()));
    }

    let mut salt = [0u8; SALT_LEN];
    let mut rng = OsRng;
    rng.fill_bytes(&mut salt);

    let remote_pub_raw = remote_pub.to_encoded_point(false);
    let local_secret = EphemeralSecret::random(&mut rng);
    let local_pub_raw = p256::PublicKey::from(&local_secret).to_encoded_point(false);

    let shared_secret = local_secret.diffie_hellman(remote_pub);

    let mut ikm_info = Vec::with_capacity(IKM_INFO_PREFIX.len() + PUBLIC_KEY_LEN * 2);
    ikm_info.extend_from_slice(IKM_INFO_PREFIX.as_bytes());
    ikm_info.extend_from_slice(remote_pub_raw.as_bytes());
    ikm_info.extend_from_slice(local_pub_raw.as_bytes());

    let ikm = hkdf_sha256(
        auth_secret,
        shared_secret.raw_secret_bytes().as_slice(),
        &ikm_info,
        32,
    )?;
    let cek = hkdf_sha256(&salt, &ikm, KEY_INFO.as_bytes(), 16)?;
    let nonce = hkdf_sha256(&salt, &ikm, NONCE_INFO.as_bytes(), 12)?;

    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|_| Error::Other("Invalid CEK length".to_string()))?;

    // Last (and only) record: delimiter 0x02, no further padding.
    let mut padded = Vec::with_capacity(plaintext.len() + 1);
    padded.extend_from_slice(plaintext);
    padded.push(2);

    let ciphertext = cipher
        .encrypt(nonce.as_slice().into(), padded.as_slice())
        .map_err(|_| Error::Other("AES-GCM encryption failed".to_string()))?;

    let mut body = Vec::with_capacity(SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&DEFAULT_RS.to_be_bytes());
    body.push(PUBLIC_KEY_LEN as u8);
    body.extend_from_slice(local_pub_raw.as_bytes());
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

fn build_vapid_jwt_with_exp(
    aud: &str,
    subject: &str,
    private_key_raw: &[u8; 32],
    exp_secs: i64,
) -> Result<(String, i64)> {
    #[derive(Serialize)]
    struct Claims<'a> {
        aud: &'a str,
        exp: i64,
        sub: &'a str,
    }

    let header = serde_json::json!({ "typ": "JWT", "alg": "ES256" });
    let exp_unix = Utc::now().timestamp() + exp_secs;
    let claims = Claims {
        aud,
        exp: exp_unix,
        sub: subject,
    };

    let header_b64 = encode_b64url(serde_json::to_string(&header)?.as_bytes());
    let claims_b64 = encode_b64url(serde_json::to_string(&claims)?.as_bytes());
    let signing_input = format!("{}.{}", header_b64, claims_b64);

    let signing_key = SigningKey::from_bytes(private_key_raw.into())
        .map_err(|_| Error::Other("Invalid VAPID private key".to_string()))?;
    let sig: p256::ecdsa::Signature = signing_key.sign(signing_input.as_bytes());
    let sig_b64 = encode_b64url(sig.to_bytes().as_slice());

    Ok((format!("{}.{}", signing_input, sig_b64), exp_unix))
}
