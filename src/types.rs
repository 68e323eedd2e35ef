use crate::orchestrator::Orchestrator;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Languages the receptionist can hold a call in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    English,
    #[serde(rename = "ar")]
    Arabic,
}

impl Language {
    pub fn tag(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Arabic => "ar",
        }
    }

    /// Accepts the short tags plus the spellings a language model tends to produce
    /// ("arabic", "ar-LB", "English").
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        let primary = tag.split(['-', '_']).next().unwrap_or_default();
        match primary {
            "en" | "eng" | "english" => Some(Language::English),
            "ar" | "ara" | "arb" | "arabic" => Some(Language::Arabic),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Language::English => Language::Arabic,
            Language::Arabic => Language::English,
        }
    }

    /// Voice used by the telephony layer's speech synthesis.
    pub fn say_voice(self) -> &'static str {
        match self {
            Language::English => "Polly.Joanna",
            Language::Arabic => "Polly.Zeina",
        }
    }

    pub fn say_language(self) -> &'static str {
        match self {
            Language::English => "en-US",
            Language::Arabic => "arb",
        }
    }

    /// Recognition language for the next speech capture.
    pub fn gather_language(self) -> &'static str {
        match self {
            Language::English => "en-US",
            Language::Arabic => "ar-LB",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// The classified purpose of one caller utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    BookAppointment,
    Confirm,
    Deny,
    ProvideInfo,
    ChangeLanguage,
    AskInfo,
    /// "What do you have free on Friday?"
    CheckAvailability,
    Unclear,
}

impl Intent {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "book_appointment" => Some(Intent::BookAppointment),
            "confirm" => Some(Intent::Confirm),
            "deny" => Some(Intent::Deny),
            "provide_info" => Some(Intent::ProvideInfo),
            "change_language" => Some(Intent::ChangeLanguage),
            "ask_info" => Some(Intent::AskInfo),
            "check_availability" => Some(Intent::CheckAvailability),
            "unclear" => Some(Intent::Unclear),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::BookAppointment => "book_appointment",
            Intent::Confirm => "confirm",
            Intent::Deny => "deny",
            Intent::ProvideInfo => "provide_info",
            Intent::ChangeLanguage => "change_language",
            Intent::AskInfo => "ask_info",
            Intent::CheckAvailability => "check_availability",
            Intent::Unclear => "unclear",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shop questions answered from the catalogue without touching the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoTopic {
    Hours,
    Services,
    Prices,
    Location,
}

impl InfoTopic {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hours" | "opening_hours" => Some(InfoTopic::Hours),
            "services" => Some(InfoTopic::Services),
            "prices" | "price" => Some(InfoTopic::Prices),
            "location" | "address" => Some(InfoTopic::Location),
            _ => None,
        }
    }
}

/// The shop's service catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Haircut,
    BeardTrim,
    HairWash,
    FullService,
}

impl Service {
    pub const ALL: [Service; 4] = [
        Service::Haircut,
        Service::BeardTrim,
        Service::HairWash,
        Service::FullService,
    ];

    pub fn duration_minutes(self) -> u32 {
        match self {
            Service::Haircut => 30,
            Service::BeardTrim => 15,
            Service::HairWash => 10,
            Service::FullService => 45,
        }
    }

    pub fn price_usd(self) -> u32 {
        match self {
            Service::Haircut => 15,
            Service::BeardTrim => 8,
            Service::HairWash => 5,
            Service::FullService => 25,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Service::Haircut => "haircut",
            Service::BeardTrim => "beard_trim",
            Service::HairWash => "hair_wash",
            Service::FullService => "full_service",
        }
    }

    /// Spoken name of the service.
    pub fn name(self, language: Language) -> &'static str {
        match (self, language) {
            (Service::Haircut, Language::English) => "haircut",
            (Service::BeardTrim, Language::English) => "beard trim",
            (Service::HairWash, Language::English) => "hair wash",
            (Service::FullService, Language::English) => "full service",
            (Service::Haircut, Language::Arabic) => "قص شعر",
            (Service::BeardTrim, Language::Arabic) => "تشذيب دقن",
            (Service::HairWash, Language::Arabic) => "غسيل شعر",
            (Service::FullService, Language::Arabic) => "الخدمة الكاملة",
        }
    }
}

pub struct AppState {
    pub orchestrator: Orchestrator,
}
