//! One language-model call per turn: the caller's utterance plus the current slot state in,
//! an intent and a slot delta out. The model's answer is untrusted. It is validated against the
//! slot schema and anything unusable degrades to an `unclear` turn.

use crate::calendar::AvailabilitySlot;
use crate::error::AppError;
use crate::normalize::{
    clean_name, date_from_utterance, detect_language, name_from_utterance, parse_date,
    parse_service, parse_time,
};
use crate::openai_types::{OpenAIBatchResponse, OpenAIMessage, OpenAIPayload, ResponseFormat};
use crate::session::{DialogState, Exchange, SlotDelta, SlotField, Slots, Speaker};
use crate::types::{InfoTopic, Intent, Language};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use time::Date;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction timed out")]
    Timeout,
    #[error("extraction transport error: {0}")]
    Transport(String),
    #[error("malformed extraction: {0}")]
    Malformed(String),
}

impl From<ExtractError> for AppError {
    fn from(e: ExtractError) -> Self {
        AppError::ExtractionUnclear(e.to_string())
    }
}

/// Everything the model sees for one turn.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub utterance: String,
    pub language: Language,
    pub state: DialogState,
    pub slots: Slots,
    /// The call's start date in shop time. Relative dates resolve against it.
    pub today: Date,
    /// Alternatives offered on the previous turn, if any.
    pub offered: Vec<AvailabilitySlot>,
    /// Recent lines of the call, oldest first, without the current utterance.
    pub history: Vec<Exchange>,
}

/// The model's answer as it came over the wire. Every field is optional and loosely typed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawExtraction {
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub slots: RawSlots,
    #[serde(default)]
    pub denied: Vec<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSlots {
    #[serde(default)]
    pub service: Option<Value>,
    #[serde(default)]
    pub date: Option<Value>,
    #[serde(default)]
    pub time: Option<Value>,
    #[serde(default)]
    pub customer_name: Option<Value>,
}

/// A validated extraction. Slot values are normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub intent: Intent,
    pub language: Option<Language>,
    pub delta: SlotDelta,
    pub denied: Vec<SlotField>,
    pub topic: Option<InfoTopic>,
    pub confidence: Option<f64>,
}

impl Extraction {
    pub fn unclear(language: Option<Language>) -> Self {
        Self {
            intent: Intent::Unclear,
            language,
            delta: SlotDelta::default(),
            denied: Vec::new(),
            topic: None,
            confidence: None,
        }
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction, ExtractError>;

    async fn ping(&self) -> Result<(), ExtractError>;
}

fn text(value: &Option<Value>) -> Option<String> {
    let s = match value.as_ref()? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    match s.to_ascii_lowercase().as_str() {
        "" | "null" | "none" | "unknown" | "n/a" => None,
        _ => Some(s),
    }
}

fn denied_field(s: &str) -> Vec<SlotField> {
    match s.trim().to_ascii_lowercase().as_str() {
        "service" => vec![SlotField::Service],
        "date" | "day" => vec![SlotField::Date],
        "time" => vec![SlotField::Time],
        "datetime" | "date_time" => vec![SlotField::Date, SlotField::Time],
        "name" | "customer_name" => vec![SlotField::CustomerName],
        _ => Vec::new(),
    }
}

/// Checks the model's answer against the slot schema. An unknown intent makes the whole turn
/// unclear. A slot value that does not normalize is dropped and turns the intent unclear, while
/// the other slots of the same answer are kept.
pub fn validate(raw: RawExtraction, request: &ExtractionRequest) -> Extraction {
    let detected = detect_language(&request.utterance);
    let language = raw
        .language
        .as_deref()
        .and_then(Language::from_tag)
        .or(detected);

    let Some(mut intent) = raw.intent.as_deref().and_then(Intent::parse) else {
        warn!(intent=?raw.intent, "model returned no usable intent");
        return Extraction::unclear(language);
    };

    // Utterance fallbacks only while collecting. "yes, today works" is not a new date.
    let recover = match intent {
        Intent::BookAppointment | Intent::ProvideInfo => request.state != DialogState::Confirm,
        Intent::CheckAvailability => true,
        _ => false,
    };
    let mut ambiguous = false;
    let mut delta = SlotDelta::default();

    if let Some(s) = text(&raw.slots.service) {
        delta.service = parse_service(&s);
        ambiguous |= delta.service.is_none();
    }
    if let Some(s) = text(&raw.slots.date) {
        delta.date = parse_date(&s, request.today);
        ambiguous |= delta.date.is_none();
    } else if recover {
        delta.date = date_from_utterance(&request.utterance, request.today);
    }
    if let Some(s) = text(&raw.slots.time) {
        delta.time = parse_time(&s);
        ambiguous |= delta.time.is_none();
    }
    if let Some(s) = text(&raw.slots.customer_name) {
        delta.customer_name = clean_name(&s);
        ambiguous |= delta.customer_name.is_none();
    } else if recover {
        delta.customer_name = name_from_utterance(&request.utterance);
    }

    if ambiguous {
        debug!(utterance=%request.utterance, "ambiguous slot value, asking again");
        intent = Intent::Unclear;
    }

    let language = match (intent, language) {
        (Intent::ChangeLanguage, Some(lang)) if lang != request.language => Some(lang),
        (Intent::ChangeLanguage, _) => Some(request.language.other()),
        (_, lang) => lang,
    };

    Extraction {
        intent,
        language,
        delta,
        denied: raw.denied.iter().flat_map(|d| denied_field(d)).collect(),
        topic: raw.topic.as_deref().and_then(InfoTopic::parse),
        confidence: raw.confidence.filter(|c| (0.0..=1.0).contains(c)),
    }
}

/// Runs one bounded extraction. Never fails: silence, timeouts, transport errors and malformed
/// answers all come back as an unclear turn with no slot changes.
pub async fn extract_turn(
    extractor: &dyn Extractor,
    request: &ExtractionRequest,
    timeout: Duration,
) -> Extraction {
    if request.utterance.trim().is_empty() {
        return Extraction::unclear(None);
    }
    let detected = detect_language(&request.utterance);
    let failure = match tokio::time::timeout(timeout, extractor.extract(request)).await {
        Ok(Ok(raw)) => return validate(raw, request),
        Ok(Err(e)) => e,
        Err(_) => ExtractError::Timeout,
    };
    let e = AppError::from(failure);
    warn!(error=%e, ?timeout, "treating turn as unclear");
    Extraction::unclear(detected)
}

const SYSTEM_PROMPT: &str = r#"You are the phone receptionist of a barbershop in Lebanon. Callers speak English or Lebanese Arabic.
Classify the caller's latest utterance and extract booking details. Answer with one JSON object and nothing else:
{
  "intent": "book_appointment" | "confirm" | "deny" | "provide_info" | "change_language" | "ask_info" | "check_availability" | "unclear",
  "language": "en" | "ar",
  "slots": {"service": string|null, "date": string|null, "time": string|null, "customer_name": string|null},
  "denied": ["service" | "date" | "time" | "name"],
  "topic": "hours" | "services" | "prices" | "location" | null,
  "confidence": number between 0 and 1
}
Rules:
- Only fill a slot the caller mentioned in this utterance. Never repeat values from the current slots.
- service is one of: haircut, beard trim, hair wash, full service.
- date is YYYY-MM-DD, or the caller's own words ("tomorrow", "friday") when unsure.
- time is 24h HH:MM, or the caller's own words when unsure.
- confirm and deny answer the confirmation question. When denying, list the rejected details in "denied" and put any replacement values in "slots".
- ask_info is a question about opening hours, services, prices or location; set "topic".
- check_availability is a question about which times are free; put the day asked about in "date" and any time in "time".
- Earlier lines of the call come before the latest utterance. Use them to resolve references like "the second one" or "same time".
- change_language is an explicit request to switch language; "language" is the requested one.
- language is the language the caller spoke in."#;

/// Extraction through an OpenAI-compatible chat completions endpoint.
pub struct OpenAiExtractor {
    pub http_client: reqwest::Client,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl OpenAiExtractor {
    fn payload(&self, request: &ExtractionRequest) -> OpenAIPayload {
        let offered: Vec<String> = request
            .offered
            .iter()
            .map(|a| format!("{} {}", a.date, a.time))
            .collect();
        let context = json!({
            "today": request.today.to_string(),
            "weekday": request.today.weekday().to_string(),
            "dialog_state": request.state.as_str(),
            "call_language": request.language.tag(),
            "current_slots": {
                "service": request.slots.service.as_ref().map(|s| s.value.as_str()),
                "date": request.slots.date.as_ref().map(|s| s.value.to_string()),
                "time": request.slots.time.as_ref().map(|s| s.value.to_string()),
                "customer_name": request.slots.customer_name.as_ref().map(|s| s.value.clone()),
            },
            "offered_alternatives": offered,
        });
        let mut messages = vec![
            OpenAIMessage {
                role: "system".to_string(),
                content: SYSTEM_PROMPT.to_string(),
            },
            OpenAIMessage {
                role: "system".to_string(),
                content: format!("Call context: {context}"),
            },
        ];
        messages.extend(request.history.iter().map(|line| OpenAIMessage {
            role: match line.speaker {
                Speaker::Caller => "user",
                Speaker::Receptionist => "assistant",
            }
            .to_string(),
            content: line.text.clone(),
        }));
        messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: request.utterance.clone(),
        });
        OpenAIPayload {
            model: self.model.clone(),
            messages,
            temperature: Some(0.0),
            max_tokens: Some(300),
            response_format: Some(ResponseFormat {
                kind: "json_object".to_string(),
            }),
        }
    }
}

/// Drops a markdown code fence some models wrap JSON in.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction, ExtractError> {
        let resp = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.payload(request))
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send openai request");
                ExtractError::Transport(e.to_string())
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            error!(%status, "openai rejected extraction request");
            return Err(ExtractError::Transport(format!("openai answered {status}")));
        }
        let batch = resp.json::<OpenAIBatchResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize openai response");
            ExtractError::Malformed(e.to_string())
        })?;
        if let Some(usage) = &batch.usage {
            debug!(id=%batch.id, model=%batch.model, tokens=usage.total_tokens, "openai usage");
        }
        let content = batch
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ExtractError::Malformed("no choices".to_string()))?;
        serde_json::from_str::<RawExtraction>(strip_fences(content)).map_err(|e| {
            warn!(error=%e, content, "model answer is not the expected json");
            ExtractError::Malformed(e.to_string())
        })
    }

    async fn ping(&self) -> Result<(), ExtractError> {
        let resp = self
            .http_client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ExtractError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ExtractError::Transport(format!(
                "openai answered {}",
                resp.status()
            )))
        }
    }
}
