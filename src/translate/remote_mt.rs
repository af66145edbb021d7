//! Remote general-purpose MT backend.
//! One call per segment, source language guessed from character classes,
//! glossary terms hidden behind placeholder tags.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::normalize::{detect_source_lang, GlossaryProtector, SourceLang};
use super::segmentor::LengthSegmentor;
use super::{Segment, SegmentContext, SegmentTranslator, TaskLog, TranslateError, TranslatorId};

const SEGMENT_LENGTH: usize = 3500;
const TARGET_LANG: &str = "zh-CHS";

/// Raw MT transport.
#[async_trait]
pub trait MtBackend: Send + Sync {
    /// Fetch a fresh request key. Failure leaves the built-in default in place.
    async fn refresh_key(&self) -> Result<(), TranslateError>;

    /// Translate newline-joined text, returning the undecoded response body.
    async fn translate_raw(
        &self,
        text: &str,
        from: SourceLang,
        cancel: &CancellationToken,
    ) -> Result<String, TranslateError>;
}

pub struct HttpMtClient {
    http: reqwest::Client,
    base_url: String,
    key: RwLock<Option<String>>,
}

#[derive(Deserialize)]
struct KeyResponse {
    key: String,
}

impl HttpMtClient {
    pub fn new(endpoint: &str) -> Result<Self, TranslateError> {
        let base_url = endpoint.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(TranslateError::InvalidInput("empty MT endpoint".into()));
        }
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            key: RwLock::new(None),
        })
    }
}

#[async_trait]
impl MtBackend for HttpMtClient {
    async fn refresh_key(&self) -> Result<(), TranslateError> {
        let resp = self
            .http
            .get(format!("{}/key", self.base_url))
            .send()
            .await
            .map_err(|e| TranslateError::ApiError(e.to_string()))?
            .error_for_status()
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;
        let parsed: KeyResponse = resp
            .json()
            .await
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;
        *self.key.write() = Some(parsed.key);
        Ok(())
    }

    async fn translate_raw(
        &self,
        text: &str,
        from: SourceLang,
        cancel: &CancellationToken,
    ) -> Result<String, TranslateError> {
        let key = self.key.read().clone();
        let mut form = vec![("i", text.to_string()), ("from", from.code().to_string()), ("to", TARGET_LANG.to_string())];
        if let Some(key) = key {
            form.push(("key", key));
        }
        let request = self
            .http
            .post(format!("{}/translate", self.base_url))
            .form(&form)
            .send();

        let resp = tokio::select! {
            resp = request => resp.map_err(|e| {
                if e.is_timeout() {
                    TranslateError::Timeout
                } else {
                    TranslateError::ApiError(e.to_string())
                }
            })?,
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        };
        if !resp.status().is_success() {
            return Err(TranslateError::ApiError(format!("MT status {}", resp.status())));
        }
        resp.text()
            .await
            .map_err(|e| TranslateError::ApiError(e.to_string()))
    }
}

#[derive(Deserialize)]
struct MtResponse {
    #[serde(rename = "translateResult")]
    translate_result: Vec<Vec<MtFragment>>,
}

#[derive(Deserialize)]
struct MtFragment {
    tgt: String,
}

/// One output line per outer entry, fragments joined after trimming their
/// trailing whitespace.
fn parse_translate_result(raw: &str) -> Option<Vec<String>> {
    let parsed: MtResponse = serde_json::from_str(raw).ok()?;
    Some(
        parsed
            .translate_result
            .into_iter()
            .map(|fragments| fragments.iter().map(|f| f.tgt.trim_end()).collect::<String>())
            .collect(),
    )
}

pub struct RemoteMtTranslator {
    client: Arc<dyn MtBackend>,
    segmentor: LengthSegmentor,
}

impl RemoteMtTranslator {
    pub async fn create(client: Arc<dyn MtBackend>, log: Arc<dyn TaskLog>) -> Self {
        if let Err(e) = client.refresh_key().await {
            warn!(error = %e, "MT key refresh failed");
            log.log("could not obtain a key, using the default", None);
        }
        Self {
            client,
            segmentor: LengthSegmentor::new(SEGMENT_LENGTH),
        }
    }
}

#[async_trait]
impl SegmentTranslator for RemoteMtTranslator {
    fn id(&self) -> TranslatorId {
        TranslatorId::RemoteMt
    }

    fn identity(&self) -> String {
        String::new()
    }

    fn segmentor(&self, lines: &[String], prior: Option<&[String]>) -> Vec<Segment> {
        self.segmentor.split(lines, prior)
    }

    async fn translate(
        &self,
        seg: &[String],
        ctx: &SegmentContext<'_>,
    ) -> Result<Vec<String>, TranslateError> {
        let protector = GlossaryProtector::new(ctx.glossary);
        let (protected, entries) = protector.protect(seg);
        let text = protected.join("\n");
        let from = detect_source_lang(&text);

        let raw = self.client.translate_raw(&text, from, ctx.cancel).await?;
        match parse_translate_result(&raw) {
            Some(output) => Ok(protector.restore(output, &entries)),
            None => {
                ctx.log.log(&format!("error: {raw}"), None);
                Err(TranslateError::Abort("unparsable MT response".into()))
            }
        }
    }
}
