use crate::consts::{SPEECH_ROUTE, SPEECH_TIMEOUT};
use crate::orchestrator::{HealthReport, TurnResponse};
use crate::twilio_types::{
    wrap_twiml, GatherAction, RedirectAction, Response, ResponseAction, SayAction, SpeechWebhook,
    StatusWebhook, VoiceWebhook,
};
use crate::types::AppState;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

fn xml_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    headers
}

fn bad_request() -> (StatusCode, HeaderMap, String) {
    (
        StatusCode::BAD_REQUEST,
        HeaderMap::new(),
        "Bad request".to_string(),
    )
}

/// TwiML for one turn: the prompts, then either another speech capture or the end of the call.
pub fn turn_twiml(turn: &TurnResponse) -> String {
    let says: Vec<SayAction> = turn
        .says
        .iter()
        .map(|spoken| SayAction {
            text: spoken.text.clone(),
            voice: Some(spoken.language.say_voice().to_string()),
            language: Some(spoken.language.say_language().to_string()),
        })
        .collect();

    let actions = if turn.end_of_call {
        says.into_iter().map(ResponseAction::Say).collect()
    } else {
        vec![
            ResponseAction::Gather(GatherAction {
                input: "speech".to_string(),
                action: SPEECH_ROUTE.to_string(),
                method: Some("POST".to_string()),
                language: Some(turn.language.gather_language().to_string()),
                speech_timeout: Some(SPEECH_TIMEOUT.to_string()),
                says,
            }),
            // reached only when the caller said nothing
            ResponseAction::Redirect(RedirectAction {
                url: SPEECH_ROUTE.to_string(),
                method: Some("POST".to_string()),
            }),
        ]
    };
    let twiml = wrap_twiml(xmlserde::xml_serialize(Response { actions }));
    trace!("twiml: '{}'", twiml);
    twiml
}

pub async fn voice_handler(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, HeaderMap, String) {
    trace!(body=%body, "voice request body");
    let payload = match serde_urlencoded::from_str::<VoiceWebhook>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio voice payload");
            return bad_request();
        }
    };
    let caller = payload.from.unwrap_or_default();
    let turn = app_state
        .orchestrator
        .greet(&payload.call_sid, &caller)
        .await;
    (StatusCode::OK, xml_headers(), turn_twiml(&turn))
}

pub async fn speech_handler(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, HeaderMap, String) {
    trace!(body=%body, "speech request body");
    let payload = match serde_urlencoded::from_str::<SpeechWebhook>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio speech payload");
            return bad_request();
        }
    };
    let utterance = payload.speech_result.unwrap_or_default();
    debug!(call_id=%payload.call_sid, utterance=%utterance, confidence=?payload.confidence, "caller said");
    let caller = payload.from.unwrap_or_default();
    let turn = app_state
        .orchestrator
        .handle_turn(&payload.call_sid, &caller, utterance.trim())
        .await;
    (StatusCode::OK, xml_headers(), turn_twiml(&turn))
}

pub async fn status_handler(State(app_state): State<Arc<AppState>>, body: String) -> StatusCode {
    let payload = match serde_urlencoded::from_str::<StatusWebhook>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio status payload");
            return StatusCode::BAD_REQUEST;
        }
    };
    info!(call_id=%payload.call_sid, status=?payload.call_status, duration=?payload.call_duration, "call status");
    if payload.call_status.is_final() {
        if let Err(e) = app_state.orchestrator.end_call(&payload.call_sid).await {
            error!(error=%e, call_id=%payload.call_sid, "failed to close session");
        }
    }
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub call_id: String,
    #[serde(default)]
    pub caller: String,
    #[serde(default)]
    pub text: String,
}

/// Drives one turn without a phone line.
pub async fn turn_handler(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<TurnRequest>,
) -> Json<TurnResponse> {
    let turn = app_state
        .orchestrator
        .handle_turn(&request.call_id, &request.caller, request.text.trim())
        .await;
    Json(turn)
}

pub async fn health_handler(
    State(app_state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthReport>) {
    let report = app_state.orchestrator.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
