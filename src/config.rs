use crate::calendar::BusinessHours;
use crate::consts::{CALENDAR_RETRIES, HEALTH_TIMEOUT_MILLIS};
use crate::dialog::{DenyTarget, DialogPolicy};
use crate::error::AppError;
use crate::orchestrator::TurnLimits;
use crate::prompts::ShopInfo;
use crate::utils::RetryPolicy;

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use time::macros::format_description;
use time::{Time, UtcOffset, Weekday};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub base_url: String,
}

/// Runtime settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub log_level: LevelFilter,
    pub database_url: Option<String>,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    /// Absent when any of the account sid, auth token or sender number is missing.
    pub twilio: Option<TwilioSettings>,
    pub shop_name: String,
    pub shop_address: String,
    pub hours: BusinessHours,
    pub session_inactivity: time::Duration,
    pub session_grace: time::Duration,
    pub sweep_interval: Duration,
    pub extract_timeout: Duration,
    pub calendar_timeout: Duration,
    pub notify_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_turns: u32,
    pub max_confirm_retries: u32,
    pub max_alternatives: usize,
    pub lookahead_days: u32,
    pub deny_default: DenyTarget,
}

fn invalid(key: &str, value: &str) -> AppError {
    AppError::Config(format!("{key}={value:?}"))
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn text(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, AppError> {
        self.optional(key)
            .ok_or_else(|| AppError::Config(format!("{key} is not set")))
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match self.optional(key) {
            Some(value) => value.parse().map_err(|_| invalid(key, &value)),
            None => Ok(default),
        }
    }

    fn clock(&self, key: &str, default: Time) -> Result<Time, AppError> {
        match self.optional(key) {
            Some(value) => Time::parse(&value, format_description!("[hour]:[minute]"))
                .map_err(|_| invalid(key, &value)),
            None => Ok(default),
        }
    }

    fn offset(&self, key: &str, default: UtcOffset) -> Result<UtcOffset, AppError> {
        match self.optional(key) {
            Some(value) => UtcOffset::parse(
                &value,
                format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
            )
            .map_err(|_| invalid(key, &value)),
            None => Ok(default),
        }
    }

    fn weekdays(&self, key: &str, default: &[Weekday]) -> Result<Vec<Weekday>, AppError> {
        let Some(value) = (self.0)(key) else {
            return Ok(default.to_vec());
        };
        value
            .split(',')
            .map(str::trim)
            .filter(|day| !day.is_empty())
            .map(|day| weekday(day).ok_or_else(|| invalid(key, &value)))
            .collect()
    }
}

fn weekday(name: &str) -> Option<Weekday> {
    match name.to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Monday),
        "tuesday" | "tue" => Some(Weekday::Tuesday),
        "wednesday" | "wed" => Some(Weekday::Wednesday),
        "thursday" | "thu" => Some(Weekday::Thursday),
        "friday" | "fri" => Some(Weekday::Friday),
        "saturday" | "sat" => Some(Weekday::Saturday),
        "sunday" | "sun" => Some(Weekday::Sunday),
        _ => None,
    }
}

impl Settings {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let env = Lookup(lookup);
        let defaults = BusinessHours::default();
        let hours = BusinessHours {
            opens: env.clock("SHOP_OPENS", defaults.opens)?,
            closes: env.clock("SHOP_CLOSES", defaults.closes)?,
            closed_days: env.weekdays("SHOP_CLOSED_DAYS", &defaults.closed_days)?,
            step_minutes: env.parsed("SLOT_STEP_MINUTES", defaults.step_minutes)?,
            offset: env.offset("SHOP_UTC_OFFSET", defaults.offset)?,
        };
        if hours.opens >= hours.closes {
            return Err(AppError::Config(
                "SHOP_OPENS must be earlier than SHOP_CLOSES".to_string(),
            ));
        }
        if hours.step_minutes == 0 {
            return Err(invalid("SLOT_STEP_MINUTES", "0"));
        }

        let twilio = match (
            env.optional("TWILIO_ACCOUNT_SID"),
            env.optional("TWILIO_AUTH_TOKEN"),
            env.optional("TWILIO_FROM_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioSettings {
                account_sid,
                auth_token,
                from_number,
                base_url: env.text("TWILIO_BASE_URL", "https://api.twilio.com"),
            }),
            _ => None,
        };

        let deny_default = match env.optional("DENY_DEFAULT_TARGET") {
            Some(value) => {
                DenyTarget::parse(&value).ok_or_else(|| invalid("DENY_DEFAULT_TARGET", &value))?
            }
            None => DenyTarget::DateTime,
        };
        let max_alternatives: usize = env.parsed("MAX_ALTERNATIVES", 3)?;
        if max_alternatives == 0 {
            return Err(invalid("MAX_ALTERNATIVES", "0"));
        }

        Ok(Self {
            bind_addr: env.parsed("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            log_level: env.parsed("LOG_LEVEL", LevelFilter::DEBUG)?,
            database_url: env.optional("DATABASE_URL"),
            openai_api_key: env.required("OPENAI_API_KEY")?,
            openai_model: env.text("OPENAI_MODEL", "gpt-4o-mini"),
            openai_base_url: env.text("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            twilio,
            shop_name: env.text("SHOP_NAME", "Mounir Cutzz"),
            shop_address: env.text("SHOP_ADDRESS", "Beirut, Lebanon"),
            hours,
            session_inactivity: time::Duration::minutes(env.parsed("SESSION_INACTIVITY_MINUTES", 10)?),
            session_grace: time::Duration::minutes(env.parsed("SESSION_GRACE_MINUTES", 60)?),
            sweep_interval: Duration::from_secs(env.parsed("SWEEP_INTERVAL_SECS", 60)?),
            extract_timeout: Duration::from_millis(env.parsed("EXTRACT_TIMEOUT_MS", 4_000)?),
            calendar_timeout: Duration::from_millis(env.parsed("CALENDAR_TIMEOUT_MS", 3_000)?),
            notify_timeout: Duration::from_millis(env.parsed("NOTIFY_TIMEOUT_MS", 10_000)?),
            retry_backoff: Duration::from_millis(env.parsed("RETRY_BACKOFF_MS", 250)?),
            max_turns: env.parsed("MAX_TURNS", 20)?,
            max_confirm_retries: env.parsed("MAX_CONFIRM_RETRIES", 2)?,
            max_alternatives,
            lookahead_days: env.parsed("LOOKAHEAD_DAYS", 7)?,
            deny_default,
        })
    }

    pub fn shop(&self) -> ShopInfo {
        ShopInfo {
            name: self.shop_name.clone(),
            address: self.shop_address.clone(),
            hours: self.hours.clone(),
        }
    }

    pub fn dialog_policy(&self) -> DialogPolicy {
        DialogPolicy {
            max_confirm_retries: self.max_confirm_retries,
            max_turns: self.max_turns,
            deny_default: self.deny_default,
        }
    }

    pub fn turn_limits(&self) -> TurnLimits {
        TurnLimits {
            extract_timeout: self.extract_timeout,
            calendar: RetryPolicy {
                timeout: self.calendar_timeout,
                backoff: self.retry_backoff,
                retries: CALENDAR_RETRIES,
            },
            notify_timeout: self.notify_timeout,
            health_timeout: Duration::from_millis(HEALTH_TIMEOUT_MILLIS),
            max_alternatives: self.max_alternatives,
            lookahead_days: self.lookahead_days,
        }
    }
}
