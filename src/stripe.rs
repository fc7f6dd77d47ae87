//! Narrow payment-processor boundary: checkout-session creation, connected
//! account payouts, and webhook signature verification. The engine never
//! touches the processor's wider account/session APIs.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::info;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signed webhooks are rejected outside this window to blunt replay.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub base_url: String,
}

impl StripeConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.stripe.com";
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("payment provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payment provider rejected the request ({status}): {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Our top-up session id, echoed back on the webhook.
    pub client_reference_id: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub account_id: String,
    pub amount: i64,
    pub currency: String,
    /// Forwarded as the provider's idempotency key so a retried call cannot
    /// produce a second payout.
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct Payout {
    pub payout_id: String,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProcessorError>;

    async fn create_payout(&self, request: &PayoutRequest) -> Result<Payout, ProcessorError>;
}

/// Real Stripe-backed processor.
pub struct StripeClient {
    config: StripeConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    url: String,
}

#[derive(Deserialize)]
struct PayoutResponse {
    id: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn into_api_error(response: reqwest::Response) -> ProcessorError {
        let status = response.status().as_u16();
        let message = match response.json::<ApiErrorBody>().await {
            Ok(body) => body.error.message,
            Err(_) => "unparseable provider error".to_string(),
        };
        ProcessorError::Api { status, message }
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProcessorError> {
        let amount = request.amount.to_string();
        let params = [
            ("mode", "payment"),
            ("success_url", &request.success_url),
            ("cancel_url", &request.cancel_url),
            ("client_reference_id", &request.client_reference_id),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", &request.currency),
            ("line_items[0][price_data][unit_amount]", &amount),
            ("line_items[0][price_data][product_data][name]", "Wallet top-up"),
        ];

        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.config.base_url))
            .bearer_auth(&self.config.secret_key)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::into_api_error(response).await);
        }

        let session: SessionResponse = response.json().await?;
        Ok(CheckoutSession {
            session_id: session.id,
            url: session.url,
        })
    }

    async fn create_payout(&self, request: &PayoutRequest) -> Result<Payout, ProcessorError> {
        let amount = request.amount.to_string();
        let params = [("amount", amount.as_str()), ("currency", &request.currency)];

        let response = self
            .http
            .post(format!("{}/v1/payouts", self.config.base_url))
            .bearer_auth(&self.config.secret_key)
            .header("Stripe-Account", &request.account_id)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::into_api_error(response).await);
        }

        let payout: PayoutResponse = response.json().await?;
        Ok(Payout {
            payout_id: payout.id,
        })
    }
}

/// Logs instead of calling out. Selected when no Stripe credentials are
/// configured, mirroring a dry-run trading backend.
pub struct DryRunProcessor;

#[async_trait]
impl PaymentProcessor for DryRunProcessor {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProcessorError> {
        let session_id = format!("cs_dryrun_{}", Uuid::new_v4().simple());
        info!(
            amount = request.amount,
            currency = %request.currency,
            %session_id,
            "Dry-run checkout session"
        );
        Ok(CheckoutSession {
            url: format!("https://checkout.invalid/{session_id}"),
            session_id,
        })
    }

    async fn create_payout(&self, request: &PayoutRequest) -> Result<Payout, ProcessorError> {
        let payout_id = format!("po_dryrun_{}", Uuid::new_v4().simple());
        info!(
            amount = request.amount,
            account = %request.account_id,
            %payout_id,
            "Dry-run payout"
        );
        Ok(Payout { payout_id })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies a `t=<unix>,v1=<hex hmac>` header over `"{t}.{payload}"`.
/// Must be called before any webhook processing; failure is terminal.
pub fn verify_webhook_signature(
    webhook_secret: &str,
    payload: &[u8],
    signature_header: &str,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }

    let signed_at = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .ok_or(SignatureError::Malformed)?;
    if (now - signed_at).num_seconds().abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::StaleTimestamp);
    }

    for candidate in candidates {
        let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
            .map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&candidate).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

/// Computes a valid signature header for `payload`. Test-side counterpart of
/// [`verify_webhook_signature`].
#[cfg(test)]
pub fn sign_webhook_payload(webhook_secret: &str, payload: &[u8], at: DateTime<Utc>) -> String {
    let timestamp = at.timestamp();
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={signature}")
}
