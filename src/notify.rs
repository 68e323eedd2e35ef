use crate::booking::BookingConfirmation;
use crate::prompts::confirmation_sms;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Sends the booking confirmation to the caller. Fire-and-forget from the dialog's view.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_confirmation(
        &self,
        caller: &str,
        confirmation: &BookingConfirmation,
    ) -> Result<(), NotifyError>;

    async fn ping(&self) -> Result<(), NotifyError>;
}

/// Twilio REST client: SMS confirmations and the account check behind the speech pipeline's
/// health entry.
pub struct TwilioClient {
    pub http_client: reqwest::Client,
    pub base_url: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub shop_name: String,
}

#[async_trait]
impl Notifier for TwilioClient {
    async fn send_confirmation(
        &self,
        caller: &str,
        confirmation: &BookingConfirmation,
    ) -> Result<(), NotifyError> {
        let account_sid = &self.account_sid;
        let url = format!(
            "{}/2010-04-01/Accounts/{account_sid}/Messages.json",
            self.base_url
        );
        let mut form = HashMap::new();
        form.insert("From", self.from_number.clone());
        form.insert("To", caller.to_string());
        form.insert("Body", confirmation_sms(&self.shop_name, confirmation));
        let resp = self
            .http_client
            .post(url)
            .basic_auth(account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send sms request to twilio");
                NotifyError(e.to_string())
            })?;
        debug!(twilio_resp=?resp, "twilio sms resp");
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!(%status, body=%body, "twilio rejected sms");
            return Err(NotifyError(format!("twilio answered {status}")));
        }
        info!(booking_ref=%confirmation.booking_ref, "confirmation sms sent");
        Ok(())
    }

    async fn ping(&self) -> Result<(), NotifyError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}.json",
            self.base_url, self.account_sid
        );
        let resp = self
            .http_client
            .get(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError(format!("twilio answered {}", resp.status())))
        }
    }
}

/// Stand-in when no Twilio account is configured: the confirmation is only logged.
pub struct LogNotifier {
    pub shop_name: String,
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_confirmation(
        &self,
        caller: &str,
        confirmation: &BookingConfirmation,
    ) -> Result<(), NotifyError> {
        info!(
            caller,
            sms=%confirmation_sms(&self.shop_name, confirmation),
            "sms delivery not configured, confirmation logged"
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), NotifyError> {
        Ok(())
    }
}
