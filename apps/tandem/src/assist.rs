use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AssistError;

#[derive(Debug, Serialize)]
struct AssistRequest<'a> {
    message: &'a str,
    context: &'a str,
}

#[derive(Debug, Deserialize)]
struct AssistResponse {
    reply: String,
}

/// Side channel to the tutoring assistant. Stateless request/response,
/// independent of the peer session: it never blocks or alters the signaling
/// protocol, and a failed call is retried only on explicit user action.
#[derive(Clone)]
pub struct AssistClient {
    http: reqwest::Client,
    url: String,
}

impl AssistClient {
    pub fn new(url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { http, url }
    }

    pub async fn suggest(&self, message: &str, context: &str) -> Result<String, AssistError> {
        let response = self
            .http
            .post(&self.url)
            .json(&AssistRequest { message, context })
            .send()
            .await?
            .error_for_status()?
            .json::<AssistResponse>()
            .await?;
        Ok(response.reply)
    }
}
