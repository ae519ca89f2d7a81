use crate::domain::{CheckoutLink, CheckoutMode, CheckoutSessionSummary, PaymentEvent};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{header, Client};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum StripeError {
    #[error("API request failed: {0}")]
    RequestFailed(String),
    #[error("Checkout session not found: {0}")]
    NotFound(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("Stripe rejected the request: {0}")]
    Rejected(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum SignatureError {
    #[error("Malformed signature header")]
    Malformed,
    #[error("Signature timestamp outside tolerance")]
    Stale,
    #[error("No matching signature")]
    Mismatch,
    #[error("Webhook secret is not a valid HMAC key")]
    InvalidSecret,
}

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503)
}

/// What is being sold in a checkout.
#[derive(Debug, Clone, PartialEq)]
pub enum LineItem {
    /// A catalogue price configured in the Stripe dashboard.
    Price(String),
    Inline {
        amount_cents: i64,
        currency: String,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutParams {
    pub mode: CheckoutMode,
    pub line_item: LineItem,
    pub metadata: HashMap<String, String>,
    pub client_reference_id: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutParams {
    fn to_form(&self) -> Vec<(String, String)> {
        let mut form = vec![
            ("mode".to_string(), self.mode.to_string()),
            ("success_url".to_string(), self.success_url.clone()),
            ("cancel_url".to_string(), self.cancel_url.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
        ];

        match &self.line_item {
            LineItem::Price(price_id) => {
                form.push(("line_items[0][price]".to_string(), price_id.clone()));
            }
            LineItem::Inline {
                amount_cents,
                currency,
                name,
            } => {
                form.push((
                    "line_items[0][price_data][currency]".to_string(),
                    currency.clone(),
                ));
                form.push((
                    "line_items[0][price_data][unit_amount]".to_string(),
                    amount_cents.to_string(),
                ));
                form.push((
                    "line_items[0][price_data][product_data][name]".to_string(),
                    name.clone(),
                ));
            }
        }

        if let Some(reference) = &self.client_reference_id {
            form.push(("client_reference_id".to_string(), reference.clone()));
        }

        // Subscription metadata is copied too so subscription events carry it.
        let mut keys: Vec<&String> = self.metadata.keys().collect();
        keys.sort();
        for key in keys {
            let value = &self.metadata[key];
            form.push((format!("metadata[{}]", key), value.clone()));
            if self.mode == CheckoutMode::Subscription {
                form.push((
                    format!("subscription_data[metadata][{}]", key),
                    value.clone(),
                ));
            }
        }

        form
    }
}

/// Payment provider operations the reconciler depends on.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        params: &CheckoutParams,
    ) -> Result<CheckoutLink, StripeError>;
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionSummary, StripeError>;
}

pub struct StripeClient {
    client: Client,
    base_url: String,
}

impl StripeClient {
    pub fn new(secret_key: &str, base_url: String) -> Result<Self, StripeError> {
        if secret_key.is_empty() {
            return Err(StripeError::InvalidConfig(
                "Stripe secret key is empty".to_string(),
            ));
        }

        let mut headers = header::HeaderMap::new();
        let auth_value = header::HeaderValue::from_str(&format!("Bearer {}", secret_key))
            .map_err(|e| StripeError::InvalidConfig(format!("Invalid API key format: {}", e)))?;
        headers.insert(header::AUTHORIZATION, auth_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| {
                StripeError::InvalidConfig(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send_with_retry<F>(
        &self,
        mut request_builder: F,
        not_found_id: Option<&str>,
    ) -> Result<reqwest::Response, StripeError>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut last_error: Option<String> = None;

        for attempt in 0..MAX_RETRIES {
            match request_builder().send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();

                    if status == 429 {
                        return Err(StripeError::RateLimited);
                    }

                    if status == 404 {
                        if let Some(id) = not_found_id {
                            return Err(StripeError::NotFound(id.to_string()));
                        }
                    }

                    if is_retryable_status(status) && attempt < MAX_RETRIES - 1 {
                        let backoff = INITIAL_BACKOFF_MS * 2_u64.pow(attempt);
                        sleep(Duration::from_millis(backoff)).await;
                        continue;
                    }

                    if !resp.status().is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(StripeError::Rejected(stripe_error_message(&body)));
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if attempt < MAX_RETRIES - 1 {
                        let backoff = INITIAL_BACKOFF_MS * 2_u64.pow(attempt);
                        sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        Err(StripeError::RequestFailed(
            last_error.unwrap_or_else(|| "Max retries exceeded".to_string()),
        ))
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(
        &self,
        params: &CheckoutParams,
    ) -> Result<CheckoutLink, StripeError> {
        let url = format!("{}/checkout/sessions", self.base_url);
        let form = params.to_form();
        // Same key on every retry so Stripe never opens two sessions.
        let idempotency_key = Uuid::new_v4().to_string();

        let resp = self
            .send_with_retry(
                || {
                    self.client
                        .post(&url)
                        .header("Idempotency-Key", idempotency_key.as_str())
                        .form(&form)
                },
                None,
            )
            .await?;

        let session: StripeCheckoutSession = resp
            .json()
            .await
            .map_err(|e| StripeError::InvalidResponse(e.to_string()))?;

        let url = session.url.clone().ok_or_else(|| {
            StripeError::InvalidResponse("checkout session without url".to_string())
        })?;

        Ok(CheckoutLink {
            session_id: session.id,
            url,
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionSummary, StripeError> {
        let url = format!("{}/checkout/sessions/{}", self.base_url, session_id);

        let resp = self
            .send_with_retry(|| self.client.get(&url), Some(session_id))
            .await?;

        let session: StripeCheckoutSession = resp
            .json()
            .await
            .map_err(|e| StripeError::InvalidResponse(e.to_string()))?;

        session.into_summary()
    }
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
    mode: String,
    payment_status: String,
    customer: Option<String>,
    subscription: Option<String>,
    amount_total: Option<i64>,
    currency: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl StripeCheckoutSession {
    fn into_summary(self) -> Result<CheckoutSessionSummary, StripeError> {
        let mode = match self.mode.as_str() {
            "subscription" => CheckoutMode::Subscription,
            "payment" => CheckoutMode::Payment,
            other => {
                return Err(StripeError::InvalidResponse(format!(
                    "unsupported checkout mode: {}",
                    other
                )))
            }
        };

        Ok(CheckoutSessionSummary {
            id: self.id,
            mode,
            paid: matches!(self.payment_status.as_str(), "paid" | "no_payment_required"),
            customer_id: self.customer,
            subscription_id: self.subscription,
            amount_total: self.amount_total,
            currency: self.currency,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeObjectRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    subscription: Option<String>,
}

fn stripe_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown error".to_string())
}

/// Parses a verified webhook payload into a provider-neutral event.
pub fn parse_event(payload: &[u8]) -> Result<PaymentEvent, StripeError> {
    let event: StripeEvent = serde_json::from_slice(payload)
        .map_err(|e| StripeError::InvalidResponse(format!("invalid event: {}", e)))?;
    let object = event.data.object;
    let invalid = |e: serde_json::Error| StripeError::InvalidResponse(e.to_string());

    let parsed = match event.event_type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            let session: StripeCheckoutSession = serde_json::from_value(object).map_err(invalid)?;
            PaymentEvent::CheckoutCompleted {
                event_id: event.id,
                session: session.into_summary()?,
            }
        }
        "checkout.session.expired" => {
            let session: StripeObjectRef = serde_json::from_value(object).map_err(invalid)?;
            PaymentEvent::CheckoutExpired {
                event_id: event.id,
                session_id: session.id,
            }
        }
        "invoice.paid" => {
            let invoice: StripeInvoice = serde_json::from_value(object).map_err(invalid)?;
            PaymentEvent::InvoicePaid {
                event_id: event.id,
                subscription_id: invoice.subscription,
            }
        }
        "customer.subscription.deleted" => {
            let subscription: StripeObjectRef = serde_json::from_value(object).map_err(invalid)?;
            PaymentEvent::SubscriptionDeleted {
                event_id: event.id,
                subscription_id: subscription.id,
            }
        }
        _ => PaymentEvent::Unhandled {
            event_id: event.id,
            event_type: event.event_type,
        },
    };

    Ok(parsed)
}

fn compute_signature(
    payload: &[u8],
    secret: &str,
    timestamp: i64,
) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Checks a `Stripe-Signature` header (`t=...,v1=...[,v1=...]`) against the payload.
pub fn verify_webhook_signature(
    payload: &[u8],
    header_value: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in header_value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => {
                if let Ok(bytes) = hex::decode(v) {
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

    if now.abs_diff(timestamp) > tolerance_secs.max(0) as u64 {
        return Err(SignatureError::Stale);
    }

    let mac = compute_signature(payload, secret, timestamp)?;
    if candidates
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok())
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Builds a `Stripe-Signature` header value for `payload`, as Stripe would send it.
pub fn sign_webhook_payload(
    payload: &[u8],
    secret: &str,
    timestamp: i64,
) -> Result<String, SignatureError> {
    let signature = compute_signature(payload, secret, timestamp)?
        .finalize()
        .into_bytes();
    Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
}
