//! Stripe payment gateway implementation

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use critiq_types::{
    CheckoutSession, CustomerId, ExternalSubscriptionId, PaymentMethod, PaymentMethodType, PriceId,
};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::error::GatewayError;
use crate::gateway::{
    CheckoutRequest, GatewayCustomer, GatewayResult, GatewaySubscription, IdempotencyKey,
    NewCustomer, NewSubscription, PaymentGateway, SubscriptionUpdate,
};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe payment gateway
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    secret_key: String,
    api_base: String,
}

impl StripeGateway {
    /// Create a new Stripe gateway
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            secret_key: secret_key.into(),
            api_base: STRIPE_API_BASE.to_string(),
        }
    }

    /// Point the client at a different API root (used by tests)
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Make authenticated request to Stripe
    async fn stripe_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, &str)],
        key: Option<&IdempotencyKey>,
    ) -> GatewayResult<T> {
        let url = format!("{}{endpoint}", self.api_base);
        let is_read = method == Method::GET;

        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(&self.secret_key, Option::<&str>::None);

        if !params.is_empty() {
            request = if is_read {
                request.query(params)
            } else {
                request.form(params)
            };
        }
        if let Some(key) = key {
            request = request.header("Idempotency-Key", key.as_str());
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, "Stripe API request failed");
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Stripe API error");
            return Err(map_stripe_error(status.as_u16(), &body));
        }

        response.json::<T>().await.map_err(|e| {
            error!(error = %e, "Failed to parse Stripe response");
            GatewayError::Api {
                status: status.as_u16(),
                message: format!("unreadable response: {e}"),
            }
        })
    }
}

/// Translate a Stripe error response into a [`GatewayError`]
fn map_stripe_error(status: u16, body: &str) -> GatewayError {
    let detail = serde_json::from_str::<StripeErrorEnvelope>(body)
        .map(|e| e.error)
        .unwrap_or_default();
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {status}"));

    let lowered = message.to_ascii_lowercase();
    if lowered.contains("no attached payment source") || lowered.contains("default payment method")
    {
        return GatewayError::NoPaymentMethod;
    }
    if status == 402 || detail.error_type.as_deref() == Some("card_error") {
        return GatewayError::CardDeclined {
            message,
            decline_code: detail.decline_code,
        };
    }
    if status == 404 || detail.code.as_deref() == Some("resource_missing") {
        return GatewayError::ResourceMissing(message);
    }
    if status == 400 {
        return GatewayError::InvalidRequest(message);
    }
    GatewayError::Api { status, message }
}

fn timestamp(secs: i64) -> GatewayResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| GatewayError::Api {
        status: 200,
        message: format!("timestamp out of range: {secs}"),
    })
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, customer), fields(user_id = %customer.user_id))]
    async fn create_customer(
        &self,
        customer: &NewCustomer,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewayCustomer> {
        debug!("Creating Stripe customer");

        let user_id = customer.user_id.to_string();
        let mut form: Vec<(&str, &str)> =
            vec![("email", customer.email.as_str()), ("metadata[user_id]", user_id.as_str())];
        if let Some(name) = &customer.name {
            form.push(("name", name.as_str()));
        }

        let raw: StripeCustomer = self
            .stripe_request(Method::POST, "/customers", &form, Some(key))
            .await?;
        Ok(raw.into())
    }

    #[instrument(skip(self))]
    async fn retrieve_customer(&self, id: &CustomerId) -> GatewayResult<GatewayCustomer> {
        debug!("Getting Stripe customer");

        let raw: StripeCustomer = self
            .stripe_request(Method::GET, &format!("/customers/{id}"), &[], None)
            .await?;
        Ok(raw.into())
    }

    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    async fn create_subscription(
        &self,
        request: &NewSubscription,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        debug!(price_id = %request.price_id, "Creating Stripe subscription");

        let user_id = request.user_id.to_string();
        let plan_id = request.plan_id.to_string();
        let form = [
            ("customer", request.customer_id.as_str()),
            ("items[0][price]", request.price_id.as_str()),
            ("payment_behavior", "error_if_incomplete"),
            ("metadata[user_id]", user_id.as_str()),
            ("metadata[plan_id]", plan_id.as_str()),
        ];

        let raw: StripeSubscription = self
            .stripe_request(Method::POST, "/subscriptions", &form, Some(key))
            .await?;
        raw.into_gateway()
    }

    #[instrument(skip(self, update))]
    async fn update_subscription(
        &self,
        id: &ExternalSubscriptionId,
        update: &SubscriptionUpdate,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        debug!("Updating Stripe subscription");

        let mut form: Vec<(&str, &str)> = Vec::new();
        if let Some(flag) = update.cancel_at_period_end {
            form.push(("cancel_at_period_end", if flag { "true" } else { "false" }));
        }

        let raw: StripeSubscription = self
            .stripe_request(Method::POST, &format!("/subscriptions/{id}"), &form, Some(key))
            .await?;
        raw.into_gateway()
    }

    #[instrument(skip(self))]
    async fn retrieve_subscription(
        &self,
        id: &ExternalSubscriptionId,
    ) -> GatewayResult<GatewaySubscription> {
        debug!("Getting Stripe subscription");

        let raw: StripeSubscription = self
            .stripe_request(Method::GET, &format!("/subscriptions/{id}"), &[], None)
            .await?;
        raw.into_gateway()
    }

    #[instrument(skip(self))]
    async fn cancel_subscription(
        &self,
        id: &ExternalSubscriptionId,
        key: &IdempotencyKey,
    ) -> GatewayResult<GatewaySubscription> {
        debug!("Canceling Stripe subscription");

        let raw: StripeSubscription = self
            .stripe_request(Method::DELETE, &format!("/subscriptions/{id}"), &[], Some(key))
            .await?;
        raw.into_gateway()
    }

    #[instrument(skip(self))]
    async fn list_payment_methods(
        &self,
        customer: &CustomerId,
    ) -> GatewayResult<Vec<PaymentMethod>> {
        debug!("Listing payment methods");

        let owner = self.retrieve_customer(customer).await?;
        let list: StripeList<StripePaymentMethod> = self
            .stripe_request(
                Method::GET,
                &format!("/customers/{customer}/payment_methods"),
                &[("limit", "100")],
                None,
            )
            .await?;

        Ok(list
            .data
            .into_iter()
            .map(|pm| {
                let is_default = owner.default_payment_method.as_deref() == Some(pm.id.as_str());
                pm.into_payment_method(is_default)
            })
            .collect())
    }

    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
        key: &IdempotencyKey,
    ) -> GatewayResult<CheckoutSession> {
        debug!(price_id = %request.price_id, "Creating checkout session");

        let user_id = request.user_id.to_string();
        let plan_id = request.plan_id.to_string();
        let trial_days = request.trial_period_days.map(|d| d.to_string());

        let mut form: Vec<(&str, &str)> = vec![
            ("customer", request.customer_id.as_str()),
            ("mode", "subscription"),
            ("success_url", request.success_url.as_str()),
            ("cancel_url", request.cancel_url.as_str()),
            ("client_reference_id", user_id.as_str()),
            ("line_items[0][price]", request.price_id.as_str()),
            ("line_items[0][quantity]", "1"),
            ("metadata[user_id]", user_id.as_str()),
            ("metadata[plan_id]", plan_id.as_str()),
            ("subscription_data[metadata][user_id]", user_id.as_str()),
            ("subscription_data[metadata][plan_id]", plan_id.as_str()),
        ];
        if let Some(days) = &trial_days {
            form.push(("subscription_data[trial_period_days]", days.as_str()));
        }

        let session: StripeCheckoutSession = self
            .stripe_request(Method::POST, "/checkout/sessions", &form, Some(key))
            .await?;

        let url = session.url.ok_or_else(|| GatewayError::Api {
            status: 200,
            message: "checkout session has no url".to_string(),
        })?;
        Ok(CheckoutSession {
            session_id: session.id,
            url,
        })
    }
}

// Stripe API response types

/// Stripe error envelope
#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct StripeErrorDetail {
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

/// Stripe customer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub invoice_settings: Option<StripeInvoiceSettings>,
}

/// Customer invoice settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeInvoiceSettings {
    pub default_payment_method: Option<String>,
}

impl From<StripeCustomer> for GatewayCustomer {
    fn from(raw: StripeCustomer) -> Self {
        Self {
            id: CustomerId(raw.id),
            email: raw.email,
            deleted: raw.deleted,
            default_payment_method: raw.invoice_settings.and_then(|s| s.default_payment_method),
        }
    }
}

/// Stripe subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub trial_start: Option<i64>,
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub items: Option<StripeList<StripeSubscriptionItem>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Subscription line item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeSubscriptionItem {
    pub price: StripePrice,
}

/// Price reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePrice {
    pub id: String,
}

impl StripeSubscription {
    /// Convert into the gateway-neutral shape
    pub fn into_gateway(self) -> GatewayResult<GatewaySubscription> {
        let price_id = self
            .items
            .as_ref()
            .and_then(|items| items.data.first())
            .map(|item| PriceId::new(item.price.id.clone()));

        Ok(GatewaySubscription {
            id: ExternalSubscriptionId(self.id),
            customer_id: CustomerId(self.customer),
            status: self.status,
            price_id,
            current_period_start: timestamp(self.current_period_start)?,
            current_period_end: timestamp(self.current_period_end)?,
            trial_start: self.trial_start.map(timestamp).transpose()?,
            trial_end: self.trial_end.map(timestamp).transpose()?,
            cancel_at_period_end: self.cancel_at_period_end,
            canceled_at: self.canceled_at.map(timestamp).transpose()?,
            metadata: self.metadata,
        })
    }
}

/// Stripe checkout session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Stripe payment method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePaymentMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub card: Option<StripeCard>,
}

/// Card details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeCard {
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<u32>,
    pub exp_year: Option<u32>,
}

impl StripePaymentMethod {
    fn into_payment_method(self, is_default: bool) -> PaymentMethod {
        let method_type = match self.method_type.as_str() {
            "card" => PaymentMethodType::Card,
            "us_bank_account" | "sepa_debit" | "bacs_debit" => PaymentMethodType::BankAccount,
            "paypal" => PaymentMethodType::PayPal,
            _ => PaymentMethodType::Other,
        };
        let card = self.card;
        PaymentMethod {
            id: self.id,
            method_type,
            is_default,
            card_brand: card.as_ref().and_then(|c| c.brand.clone()),
            card_last4: card.as_ref().and_then(|c| c.last4.clone()),
            card_exp_month: card.as_ref().and_then(|c| c.exp_month),
            card_exp_year: card.as_ref().and_then(|c| c.exp_year),
        }
    }
}

/// Stripe list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeList<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}
