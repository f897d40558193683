use reqwest::multipart::{Form, Part};
use serde::{Deserialize, de::DeserializeOwned};
use url::Url;

use super::{ClientConfig, ClientError};
use crate::{
    message::{ChatUser, Message},
    upload::UploadResponse,
};

/// HTTP calls against the chat server.
#[derive(Debug, Clone)]
pub struct ChatApi {
    http: reqwest::Client,
    base: Url,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl ChatApi {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(ChatApi {
            http: reqwest::Client::new(),
            base: config.base()?,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidBaseUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Full history between `a` and `b`, oldest first.
    pub async fn history(&self, a: &str, b: &str) -> Result<Vec<Message>, ClientError> {
        let url = self.endpoint(&["chat", a, b])?;
        decode(self.http.get(url).send().await?).await
    }

    pub async fn chat_users(&self, username: &str) -> Result<Vec<ChatUser>, ClientError> {
        let mut url = self.endpoint(&["api", "chat-users"])?;
        url.query_pairs_mut().append_pair("username", username);
        decode(self.http.get(url).send().await?).await
    }

    /// Uploads one media file; the returned `url` is relative to the server origin.
    pub async fn upload(
        &self,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ClientError> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)?;
        let form = Form::new().part("file", part);
        let url = self.endpoint(&["upload"])?;
        decode(self.http.post(url).multipart(form).send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        return Err(ClientError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.json().await?)
}
