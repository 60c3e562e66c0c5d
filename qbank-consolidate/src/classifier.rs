//! Optional classifier adjunct
//!
//! A remote service may suggest which container an item belongs in. Its
//! answer is advice only: plans are built by the deterministic heuristic
//! and the advice is recorded beside them. An absent or unresponsive
//! classifier never changes an outcome.

use crate::normalize::same_label;
use async_trait::async_trait;
use qbank_common::config::ClassifierConfig;
use qbank_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = concat!("qbank-consolidate/", env!("CARGO_PKG_VERSION"));

/// Suggested placement for one piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Label of the suggested container
    pub target: String,
    pub score: f64,
    #[serde(default)]
    pub reason: String,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// `Ok(None)` means the classifier had no opinion
    async fn suggest(
        &self,
        label: &str,
        content: &str,
        candidate_labels: &[String],
    ) -> Result<Option<Suggestion>>;
}

/// What the classifier said about a plan, for observability
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(tag = "advice", rename_all = "snake_case")]
pub enum Advice {
    /// No classifier configured (or nothing to classify)
    #[default]
    NotConfigured,
    /// Classifier answered without a suggestion
    Abstained,
    /// Classifier suggests the planned target
    Agreed { score: f64 },
    /// Classifier suggests a different container; the plan is unchanged
    Suggested(Suggestion),
    /// Classifier configured but failed or timed out
    FallbackUsed { error: String },
}

/// Ask `classifier` about a planned placement and fold the answer into [`Advice`]
pub async fn advise(
    classifier: Option<&dyn Classifier>,
    label: &str,
    content: &str,
    target_label: &str,
) -> Advice {
    let Some(classifier) = classifier else {
        return Advice::NotConfigured;
    };

    let candidates = vec![target_label.to_string()];
    match classifier.suggest(label, content, &candidates).await {
        Ok(Some(suggestion)) if same_label(&suggestion.target, target_label) => Advice::Agreed {
            score: suggestion.score,
        },
        Ok(Some(suggestion)) => {
            tracing::info!(
                suggested = %suggestion.target,
                planned = %target_label,
                score = suggestion.score,
                "Classifier suggests a different target; plan unchanged"
            );
            Advice::Suggested(suggestion)
        }
        Ok(None) => Advice::Abstained,
        Err(e) => {
            tracing::warn!(error = %e, "Classifier unavailable, heuristic result used");
            Advice::FallbackUsed { error: e.to_string() }
        }
    }
}

#[derive(Debug, Serialize)]
struct SuggestRequest<'a> {
    label: &'a str,
    content: &'a str,
    candidates: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SuggestResponse {
    suggestion: Option<Suggestion>,
}

/// JSON-over-HTTP classifier
///
/// POSTs `{label, content, candidates}` and expects
/// `{"suggestion": {"target", "score", "reason"} | null}`.
pub struct HttpClassifier {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Classifier(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn suggest(
        &self,
        label: &str,
        content: &str,
        candidate_labels: &[String],
    ) -> Result<Option<Suggestion>> {
        let request = SuggestRequest {
            label,
            content,
            candidates: candidate_labels,
        };

        tracing::debug!(endpoint = %self.endpoint, candidates = candidate_labels.len(), "Querying classifier");

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Classifier(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Classifier(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let parsed: SuggestResponse = response
            .json()
            .await
            .map_err(|e| Error::Classifier(format!("invalid response: {}", e)))?;

        Ok(parsed.suggestion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<Option<Suggestion>>);

    #[async_trait]
    impl Classifier for Fixed {
        async fn suggest(&self, _: &str, _: &str, _: &[String]) -> Result<Option<Suggestion>> {
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(Error::Classifier(e.to_string())),
            }
        }
    }

    fn suggestion(target: &str) -> Suggestion {
        Suggestion {
            target: target.to_string(),
            score: 0.9,
            reason: "similar items".to_string(),
        }
    }

    #[tokio::test]
    async fn test_not_configured() {
        assert_eq!(advise(None, "a", "b", "Shared").await, Advice::NotConfigured);
    }

    #[tokio::test]
    async fn test_agreement_uses_normalized_labels() {
        let classifier = Fixed(Ok(Some(suggestion("  SHARED "))));
        let advice = advise(Some(&classifier), "a", "b", "Shared").await;
        assert_eq!(advice, Advice::Agreed { score: 0.9 });
    }

    #[tokio::test]
    async fn test_disagreement_is_recorded() {
        let classifier = Fixed(Ok(Some(suggestion("Geometry"))));
        let advice = advise(Some(&classifier), "a", "b", "Shared").await;
        assert!(matches!(advice, Advice::Suggested(s) if s.target == "Geometry"));
    }

    #[tokio::test]
    async fn test_failure_falls_back() {
        let classifier = Fixed(Err(Error::Classifier("timeout".to_string())));
        let advice = advise(Some(&classifier), "a", "b", "Shared").await;
        assert!(matches!(advice, Advice::FallbackUsed { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let classifier = HttpClassifier::new(&ClassifierConfig {
            endpoint: "http://127.0.0.1:9/suggest".to_string(),
            timeout_ms: 200,
        })
        .unwrap();

        let result = classifier.suggest("a", "b", &[]).await;
        assert!(matches!(result, Err(Error::Classifier(_))));
    }
}
