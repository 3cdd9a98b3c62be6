use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::LanguageModel;
use crate::prompt;
use crate::schema::{Classification, SchemaRegistry};

const LOW_CONFIDENCE: f32 = 0.5;

/// Picks a document type from the registry's closed set. Never fails: any
/// problem with the model or its answer falls back to the generic schema.
pub struct Classifier {
    llm: Arc<dyn LanguageModel>,
    registry: Arc<SchemaRegistry>,
    max_repairs: usize,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LanguageModel>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            llm,
            registry,
            max_repairs: 1,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub async fn classify(&self, document_id: &str, text: &str, source_path: &str) -> Classification {
        let prompt =
            prompt::build_classification_prompt(text, source_path, self.registry.schemas());

        let response = match self.llm.generate_json(&prompt, self.max_repairs).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    document_id,
                    error = %e,
                    quality_warning = true,
                    "Classification call failed, using generic schema"
                );
                return self.fallback();
            }
        };

        let detected = response
            .get("type")
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_lowercase());
        let confidence = response
            .get("confidence")
            .and_then(|c| c.as_f64())
            .map(|c| (c as f32).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        let Some(schema) = detected.as_deref().and_then(|t| self.registry.for_type(t)) else {
            warn!(
                document_id,
                detected = ?detected,
                quality_warning = true,
                "Unknown document type, using generic schema"
            );
            return self.fallback();
        };

        if confidence < LOW_CONFIDENCE {
            warn!(
                document_id,
                document_type = %schema.document_type,
                confidence,
                quality_warning = true,
                "Low-confidence classification"
            );
        }

        info!(
            document_id,
            document_type = %schema.document_type,
            schema_id = %schema.schema_id,
            confidence,
            "Classified document"
        );

        Classification {
            document_type: schema.document_type.clone(),
            schema_id: schema.schema_id.clone(),
            confidence,
        }
    }

    fn fallback(&self) -> Classification {
        let generic = self.registry.generic();
        Classification {
            document_type: generic.document_type.clone(),
            schema_id: generic.schema_id.clone(),
            confidence: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use async_trait::async_trait;

    struct Fixed(Result<&'static str, fn() -> LlmError>);

    #[async_trait]
    impl LanguageModel for Fixed {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            match &self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(make) => Err(make()),
            }
        }
    }

    fn classifier(model: Fixed) -> Classifier {
        Classifier::new(Arc::new(model), Arc::new(SchemaRegistry::builtin()))
    }

    #[tokio::test]
    async fn known_type_selects_its_schema() {
        let c = classifier(Fixed(Ok(r#"{"type": "Invoice", "confidence": 0.92}"#)));
        let result = c.classify("doc-1", "Invoice #42", "a.txt").await;
        assert_eq!(result.document_type, "invoice");
        assert_eq!(result.schema_id, "invoice@1");
        assert!((result.confidence - 0.92).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_type_falls_back_to_generic() {
        let c = classifier(Fixed(Ok(r#"{"type": "recipe", "confidence": 0.99}"#)));
        let result = c.classify("doc-1", "Mix flour", "a.txt").await;
        assert_eq!(result.schema_id, "generic@1");
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn model_failure_is_not_fatal() {
        let c = classifier(Fixed(Err(|| LlmError::Transport("refused".into()))));
        let result = c.classify("doc-1", "", "a.txt").await;
        assert_eq!(result.document_type, "generic");
    }
}
