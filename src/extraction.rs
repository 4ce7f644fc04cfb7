use crate::config::Config;
use crate::db_types::{FieldUpdate, FlagField, ServiceCategory, TextField, TranscriptEntry};
use crate::openai_types::{OpenAIBatchResponse, OpenAIMessage, OpenAIPayload, ResponseFormat};
use crate::utils::normalize_postcode;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("extraction request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("extraction service returned status {0}")]
    Status(u16),
    #[error("malformed extraction output: {0}")]
    Malformed(String),
    #[error("extraction timed out")]
    Timeout,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: &'static str,
    pub content: String,
}

/// What is sent to the extraction service for one customer utterance.
#[derive(Serialize, Clone, Debug)]
pub struct ExtractionRequest {
    pub utterance: String,
    /// Prior turns, oldest first.
    pub context: Vec<ContextMessage>,
}

impl ExtractionRequest {
    pub fn new(utterance: &str, history: &[TranscriptEntry]) -> Self {
        Self {
            utterance: utterance.to_string(),
            context: history
                .iter()
                .map(|t| ContextMessage {
                    role: t.speaker.role(),
                    content: t.text.clone(),
                })
                .collect(),
        }
    }

    fn conversation(&self) -> String {
        self.context
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .chain(std::iter::once(("customer", self.utterance.as_str())))
            .map(|(role, content)| format!("{}: {content}", role.to_uppercase()))
            .collect::<Vec<String>>()
            .join("\n")
    }
}

/// The recognised response schema.  Unknown keys are ignored; `null` or an empty string
/// means the field was not extracted this turn.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(from = "RawFields")]
pub struct ExtractedFields {
    pub customer_name: Option<String>,
    pub postcode: Option<String>,
    pub customer_address: Option<String>,
    pub customer_email: Option<String>,
    pub service: Option<String>,
    pub skip_size: Option<String>,
    pub waste_type: Option<String>,
    pub grab_material: Option<String>,
    pub when_needed: Option<String>,
    pub trade_customer: Option<bool>,
    pub callback_requested: Option<bool>,
    pub complaint: Option<bool>,
    pub quote_provided: Option<bool>,
    pub booking_confirmed: Option<bool>,
    pub payment_link_sent: Option<bool>,
}

/// Wire form: models sometimes answer with the short key names, occasionally alongside
/// the full ones.
#[derive(Deserialize, Default)]
#[serde(default)]
struct RawFields {
    customer_name: Option<String>,
    name: Option<String>,
    postcode: Option<String>,
    customer_address: Option<String>,
    address: Option<String>,
    customer_email: Option<String>,
    email: Option<String>,
    service: Option<String>,
    service_type: Option<String>,
    skip_size: Option<String>,
    waste_type: Option<String>,
    grab_material: Option<String>,
    when_needed: Option<String>,
    trade_customer: Option<bool>,
    callback_requested: Option<bool>,
    complaint: Option<bool>,
    quote_provided: Option<bool>,
    booking_confirmed: Option<bool>,
    payment_link_sent: Option<bool>,
}

/// The full key wins unless it is blank.
fn prefer(full: Option<String>, short: Option<String>) -> Option<String> {
    full.filter(|v| !v.trim().is_empty()).or(short)
}

impl From<RawFields> for ExtractedFields {
    fn from(raw: RawFields) -> Self {
        Self {
            customer_name: prefer(raw.customer_name, raw.name),
            postcode: raw.postcode,
            customer_address: prefer(raw.customer_address, raw.address),
            customer_email: prefer(raw.customer_email, raw.email),
            service: prefer(raw.service, raw.service_type),
            skip_size: raw.skip_size,
            waste_type: raw.waste_type,
            grab_material: raw.grab_material,
            when_needed: raw.when_needed,
            trade_customer: raw.trade_customer,
            callback_requested: raw.callback_requested,
            complaint: raw.complaint,
            quote_provided: raw.quote_provided,
            booking_confirmed: raw.booking_confirmed,
            payment_link_sent: raw.payment_link_sent,
        }
    }
}

impl ExtractedFields {
    /// Parse a response body.  Anything other than a JSON object matching the schema is
    /// rejected as a whole.
    pub fn parse(body: &str) -> Result<Self, ExtractionError> {
        let value: serde_json::Value = serde_json::from_str(body.trim())
            .map_err(|e| ExtractionError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(ExtractionError::Malformed("expected a JSON object".to_string()));
        }
        serde_json::from_value(value).map_err(|e| ExtractionError::Malformed(e.to_string()))
    }

    pub fn into_updates(self) -> Vec<FieldUpdate> {
        let mut updates = vec![];
        let mut text = |field: TextField, value: Option<String>| {
            let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
            else {
                return;
            };
            let value = match field {
                TextField::Postcode => normalize_postcode(&value),
                TextField::Service => match value.parse::<ServiceCategory>() {
                    Ok(category) => category.as_str().to_string(),
                    Err(e) => {
                        debug!(error=%e, "ignoring unknown service category");
                        return;
                    }
                },
                _ => value,
            };
            updates.push(FieldUpdate::Text(field, value));
        };
        text(TextField::CustomerName, self.customer_name);
        text(TextField::Postcode, self.postcode);
        text(TextField::CustomerAddress, self.customer_address);
        text(TextField::CustomerEmail, self.customer_email);
        text(TextField::Service, self.service);
        text(TextField::SkipSize, self.skip_size);
        text(TextField::WasteType, self.waste_type);
        text(TextField::GrabMaterial, self.grab_material);
        text(TextField::WhenNeeded, self.when_needed);

        let flags = [
            (FlagField::TradeCustomer, self.trade_customer),
            (FlagField::CallbackRequested, self.callback_requested),
            (FlagField::Complaint, self.complaint),
            (FlagField::QuoteProvided, self.quote_provided),
            (FlagField::BookingConfirmed, self.booking_confirmed),
            (FlagField::PaymentLinkSent, self.payment_link_sent),
        ];
        updates.extend(
            flags
                .into_iter()
                .filter(|(_, value)| *value == Some(true))
                .map(|(flag, _)| FieldUpdate::Flag(flag)),
        );
        updates
    }
}

/// Structured field extraction from customer speech.  Any error means nothing is merged
/// for that turn.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractedFields, ExtractionError>;
}

/// Pick the configured extraction backend, if any.
pub fn from_config(config: &Config, http_client: reqwest::Client) -> Option<Arc<dyn Extractor>> {
    if let Some(url) = &config.extraction_url {
        return Some(Arc::new(HttpExtractor {
            http_client,
            url: url.clone(),
            timeout: config.extraction_timeout,
        }));
    }
    config.openai_api_key.as_ref().map(|key| {
        Arc::new(OpenAIExtractor {
            http_client,
            api_key: key.clone(),
            model: config.openai_model.clone(),
            timeout: config.extraction_timeout,
        }) as Arc<dyn Extractor>
    })
}

/// Posts the request as JSON and expects the flat field object back.
pub struct HttpExtractor {
    pub http_client: reqwest::Client,
    pub url: String,
    pub timeout: Duration,
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractedFields, ExtractionError> {
        let resp = self
            .http_client
            .post(&self.url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to extraction service");
                e
            })?;
        if !resp.status().is_success() {
            return Err(ExtractionError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        ExtractedFields::parse(&body)
    }
}

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAIExtractor {
    pub http_client: reqwest::Client,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl OpenAIExtractor {
    fn prompt(request: &ExtractionRequest) -> String {
        let services = ServiceCategory::ALL
            .iter()
            .map(|s| format!("\"{}\"", s.as_str()))
            .collect::<Vec<String>>()
            .join(", ");
        format!(
            r#"Extract information from this waste services phone call. Return JSON only.

Conversation:
{conversation}

Extract EXACTLY:
- customer_name: Full name
- postcode: UK postcode with space (e.g., "LS14 8AB", "LU7 2RC")
- customer_address: Street address
- customer_email: Email address
- service: One of: {services}
- skip_size: Skip size if mentioned
- waste_type: Type of waste
- grab_material: Material for grab hire
- when_needed: When service needed
- trade_customer, callback_requested, complaint, quote_provided, booking_confirmed: true/false

CRITICAL - Postcode:
- If customer says "LS one four ED" -> "LS1 4ED"
- If customer says "LU seven two RC" -> "LU7 2RC"
- Always format with space before last 3 characters

Use "" or false for anything not mentioned."#,
            conversation = request.conversation(),
        )
    }
}

#[async_trait]
impl Extractor for OpenAIExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractedFields, ExtractionError> {
        let payload = OpenAIPayload {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: Self::prompt(request),
            }],
            max_tokens: Some(250),
            temperature: Some(0.1),
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let key = self.api_key.as_str();
        let resp = self
            .http_client
            .post(OPENAI_URL)
            .timeout(self.timeout)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to OpenAI");
                e
            })?;
        if !resp.status().is_success() {
            return Err(ExtractionError::Status(resp.status().as_u16()));
        }
        let resp = resp.json::<OpenAIBatchResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize openai extraction response");
            ExtractionError::Malformed(e.to_string())
        })?;
        debug!(id=%resp.id, model=%resp.model, usage=?resp.usage, "openai extraction response");
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ExtractionError::Malformed("no choices returned".to_string()))?;
        debug!(finish_reason=?choice.finish_reason, content=%choice.message.content, "extracted");
        ExtractedFields::parse(&choice.message.content)
    }
}
