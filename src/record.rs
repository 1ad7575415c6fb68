//! Request validation and the record generation pipeline.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, Namespace};
use crate::generation::{GenerationClient, GenerationError};
use crate::prompt;
use crate::seeds::ExampleBank;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: String,
    pub content: String,
}

/// `cpt_codes` arrives either as one string or as a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodesInput {
    Single(String),
    Many(Vec<String>),
}

impl CodesInput {
    /// Trimmed, non-empty codes in caller order. A single string may hold a
    /// comma-separated list.
    pub fn normalize(self) -> Vec<String> {
        let raw = match self {
            CodesInput::Single(s) => s.split(',').map(str::to_string).collect(),
            CodesInput::Many(v) => v,
        };
        raw.into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

/// Inbound request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub cpt_codes: Option<CodesInput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub diagnosis_code: String,
    pub procedure_codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("messages must contain at least one entry holding the diagnosis code")]
    NoMessages,
    #[error("diagnosis code (content of the first message) is empty")]
    EmptyDiagnosis,
    #[error("model identifier is empty")]
    EmptyModel,
    #[error("cpt_codes must contain at least one non-empty procedure code")]
    NoProcedureCodes,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl RecordRequest {
    /// Applies `default_model` when the request names none.
    pub fn validate(self, default_model: &str) -> Result<GenerationRequest, ValidationError> {
        let first = self.messages.into_iter().next().ok_or(ValidationError::NoMessages)?;
        let diagnosis_code = first.content.trim().to_string();
        if diagnosis_code.is_empty() {
            return Err(ValidationError::EmptyDiagnosis);
        }

        let model = self
            .model
            .unwrap_or_else(|| default_model.to_string())
            .trim()
            .to_string();
        if model.is_empty() {
            return Err(ValidationError::EmptyModel);
        }

        let procedure_codes = self.cpt_codes.map(CodesInput::normalize).unwrap_or_default();
        if procedure_codes.is_empty() {
            return Err(ValidationError::NoProcedureCodes);
        }

        Ok(GenerationRequest {
            model,
            diagnosis_code,
            procedure_codes,
        })
    }
}

pub struct RecordService {
    catalog: Arc<Catalog>,
    examples: Arc<ExampleBank>,
    client: GenerationClient,
    default_model: String,
}

impl RecordService {
    pub fn new(
        catalog: Arc<Catalog>,
        examples: Arc<ExampleBank>,
        client: GenerationClient,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            examples,
            client,
            default_model: default_model.into(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn examples(&self) -> &ExampleBank {
        &self.examples
    }

    pub fn build_prompt<R: Rng + ?Sized>(
        &self,
        request: &GenerationRequest,
        rng: &mut R,
    ) -> String {
        let diagnosis = self
            .catalog
            .resolve(&request.diagnosis_code, Namespace::Diagnosis);
        let procedures: Vec<_> = request
            .procedure_codes
            .iter()
            .map(|c| self.catalog.resolve(c, Namespace::Procedure))
            .collect();
        let examples = self.examples.select(&request.procedure_codes, rng);

        let unresolved =
            procedures.iter().filter(|p| !p.found).count() + usize::from(!diagnosis.found);
        if unresolved > 0 {
            tracing::info!(unresolved, "some codes missing from the catalog; raw codes used");
        }

        prompt::compose(&diagnosis, &procedures, &examples)
    }

    pub async fn handle(&self, raw: RecordRequest) -> Result<String, RecordError> {
        let request = raw.validate(&self.default_model)?;
        let prompt = self.build_prompt(&request, &mut rand::thread_rng());

        tracing::info!(
            model = %request.model,
            diagnosis = %request.diagnosis_code,
            procedures = request.procedure_codes.len(),
            prompt_chars = prompt.len(),
            "generating record"
        );

        let text = self.client.generate(&request.model, &prompt).await?;
        Ok(text)
    }
}
