// src/sources/openai.rs
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LookupError, LookupResult};
use crate::source::{FetchContext, Source, SourceAnswer};
use crate::text::normalize_text;
use crate::types::{
    DeathFields, EnrichmentPayload, EnrichmentSubject, ReliabilityTier, SourceCategory,
    SourceDescriptor,
};

const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
/// Upper estimate per query, reserved before the call.
const ESTIMATED_COST: f64 = 0.002;
// gpt-4o-mini list prices, USD per token.
const PRICE_IN: f64 = 0.15 / 1_000_000.0;
const PRICE_OUT: f64 = 0.60 / 1_000_000.0;

const SYSTEM_PROMPT: &str = "You answer questions about how notable people died. \
Reply with ONE JSON object and nothing else: \
{\"known\": bool, \"cause\": string|null, \"manner\": string|null, \"location\": string|null, \
\"circumstances\": string|null, \"confidence\": number between 0 and 1}. \
Set known=false and all fields null if you are not sure which person is meant or do not know.";

/// What the model is asked to return.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelAnswer {
    #[serde(default)]
    pub known: bool,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub manner: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub circumstances: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl ModelAnswer {
    fn into_fields(self) -> DeathFields {
        let clean = |v: Option<String>| v.map(|s| normalize_text(&s)).filter(|s| !s.is_empty());
        DeathFields {
            cause: clean(self.cause),
            manner: clean(self.manner),
            location: clean(self.location),
            circumstances: clean(self.circumstances),
            ..Default::default()
        }
    }
}

/// Parse the model's message content. Tolerates a fenced code block.
pub fn parse_model_answer(content: &str) -> LookupResult<ModelAnswer> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed)
        .map_err(|e| LookupError::Transient(format!("model returned invalid JSON: {e}")))
}

/// Chat-completions source. Requires `OPENAI_API_KEY`.
pub struct OpenAiSource {
    descriptor: SourceDescriptor,
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiSource {
    /// Key from `OPENAI_API_KEY`, model from `OPENAI_MODEL` (defaults to gpt-4o-mini).
    pub fn from_env() -> LookupResult<Self> {
        let key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let model = std::env::var("OPENAI_MODEL").ok();
        Self::new(&key, model.as_deref())
    }

    pub fn new(api_key: &str, model_override: Option<&str>) -> LookupResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(Duration::from_secs(4))
            .build()
            .map_err(|e| LookupError::Unavailable(format!("openai client: {e}")))?;
        let descriptor = SourceDescriptor::new(
            "openai",
            "OpenAI",
            ReliabilityTier::AiModel,
            SourceCategory::AiModel,
        )
        .cost(ESTIMATED_COST)
        .min_delay(Duration::from_millis(250))
        .cache_ttl(Some(Duration::from_secs(90 * 24 * 3600)))
        .max_confidence(0.7);
        Ok(Self {
            descriptor,
            http,
            api_key: api_key.trim().to_string(),
            model: model_override.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    fn question(subject: &EnrichmentSubject) -> String {
        let mut q = format!("Person: {}.", subject.name.trim());
        if let Some(b) = subject.birth_date {
            q.push_str(&format!(" Born {b}."));
        }
        if let Some(d) = subject.death_date {
            q.push_str(&format!(" Died {d}."));
        }
        q.push_str(" How did this person die?");
        q
    }
}

#[async_trait]
impl Source for OpenAiSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Without a death date the model cannot tell namesakes apart.
    fn check_preconditions(&self, subject: &EnrichmentSubject) -> LookupResult<()> {
        if subject.death_date.is_none() {
            return Err(LookupError::PreconditionFailed("death date required".into()));
        }
        Ok(())
    }

    fn query_text(&self, subject: &EnrichmentSubject) -> String {
        format!("{}|{}", self.model, Self::question(subject))
    }

    async fn fetch(&self, subject: &EnrichmentSubject, ctx: &FetchContext) -> LookupResult<SourceAnswer> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
            response_format: ResponseFormat,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Option<Usage>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }
        #[derive(Deserialize)]
        struct Usage {
            prompt_tokens: u64,
            completion_tokens: u64,
        }

        let question = Self::question(subject);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &question,
                },
            ],
            temperature: 0.0,
            max_tokens: 300,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let resp = self
            .http
            .post(CHAT_URL)
            .bearer_auth(&self.api_key)
            .timeout(ctx.timeout)
            .json(&req)
            .send()
            .await?;
        match resp.status().as_u16() {
            401 => return Err(LookupError::Unavailable("openai rejected the api key".into())),
            s if s == 429 || s >= 500 => return Err(LookupError::Transient(format!("openai http {s}"))),
            _ => {}
        }
        let body: Resp = resp.error_for_status()?.json().await?;
        let cost = body
            .usage
            .map(|u| u.prompt_tokens as f64 * PRICE_IN + u.completion_tokens as f64 * PRICE_OUT);
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");

        let answer = parse_model_answer(content)?;
        let known = answer.known;
        let raw = serde_json::to_string(&answer).unwrap_or_default();
        let payload = EnrichmentPayload {
            fields: if known { answer.into_fields() } else { DeathFields::default() },
            source_url: None,
        };
        let mut out = SourceAnswer::new(payload, raw);
        out.cost = cost;
        Ok(out)
    }

    fn confidence(&self, _subject: &EnrichmentSubject, answer: &SourceAnswer) -> f64 {
        let reported = serde_json::from_str::<ModelAnswer>(&answer.raw_response)
            .ok()
            .and_then(|a| a.confidence)
            .unwrap_or(0.5);
        reported * 0.9
    }
}
