pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Gather")]
        Gather(GatherAction),
        #[xmlserde(name = b"Redirect")]
        Redirect(RedirectAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    /// Speech capture. Prompts nested inside are interrupted when the caller starts talking.
    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct GatherAction {
        #[xmlserde(name = b"input", ty = "attr")]
        pub input: String,
        #[xmlserde(name = b"action", ty = "attr")]
        pub action: String,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
        #[xmlserde(name = b"speechTimeout", ty = "attr")]
        pub speech_timeout: Option<String>,
        #[xmlserde(name = b"Say", ty = "child")]
        pub says: Vec<SayAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct RedirectAction {
        #[xmlserde(ty = "text")]
        pub url: String,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
    }
}
pub use twiml::*;

mod webhook {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    impl CallStatus {
        /// The call is over and nobody is listening any more.
        pub fn is_final(self) -> bool {
            matches!(
                self,
                CallStatus::Completed
                    | CallStatus::Busy
                    | CallStatus::Failed
                    | CallStatus::NoAnswer
                    | CallStatus::Canceled
            )
        }
    }

    /// Posted when a call is answered.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct VoiceWebhook {
        pub call_sid: String,
        #[serde(default)]
        pub from: Option<String>,
        #[serde(default)]
        pub call_status: Option<CallStatus>,
    }

    /// Posted by a Gather with the recognised caller speech.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct SpeechWebhook {
        pub call_sid: String,
        #[serde(default)]
        pub from: Option<String>,
        #[serde(default)]
        pub speech_result: Option<String>,
        #[serde(default)]
        pub confidence: Option<f64>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct StatusWebhook {
        pub call_sid: String,
        pub call_status: CallStatus,
        #[serde(default)]
        pub call_duration: Option<String>,
    }
}
pub use webhook::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_nests_prompts() {
        let response = Response {
            actions: vec![ResponseAction::Gather(GatherAction {
                input: "speech".to_string(),
                action: "/twilio/speech".to_string(),
                method: Some("POST".to_string()),
                language: Some("ar-LB".to_string()),
                says: vec![SayAction {
                    text: "شو الاسم للحجز؟".to_string(),
                    voice: Some("Polly.Zeina".to_string()),
                    language: Some("arb".to_string()),
                }],
                ..Default::default()
            })],
        };
        let twiml = wrap_twiml(xmlserde::xml_serialize(response));
        assert!(twiml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Gather"));
        assert!(twiml.contains("input=\"speech\""));
        assert!(twiml.contains("language=\"ar-LB\""));
        assert!(twiml.contains(">شو الاسم للحجز؟</Say></Gather></Response>"));
    }

    #[test]
    fn speech_webhook_parses_form() {
        let body = "CallSid=CA123&From=%2B96170000000&SpeechResult=tomorrow+at+3&Confidence=0.91&AccountSid=AC1";
        let hook: SpeechWebhook = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(hook.call_sid, "CA123");
        assert_eq!(hook.from.as_deref(), Some("+96170000000"));
        assert_eq!(hook.speech_result.as_deref(), Some("tomorrow at 3"));
        assert_eq!(hook.confidence, Some(0.91));

        let silent: SpeechWebhook = serde_urlencoded::from_str("CallSid=CA123").unwrap();
        assert!(silent.speech_result.is_none());
    }

    #[test]
    fn final_statuses() {
        let hook: StatusWebhook =
            serde_urlencoded::from_str("CallSid=CA1&CallStatus=no-answer&CallDuration=0").unwrap();
        assert_eq!(hook.call_status, CallStatus::NoAnswer);
        assert!(hook.call_status.is_final());
        assert!(!CallStatus::InProgress.is_final());
    }
}
