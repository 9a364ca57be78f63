//! Adapter over the black-box image classification capability.

use image::DynamicImage;
use log::debug;

/// Opaque failure reported by a classification model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Inference(String),
}

/// Why no subject could be identified for an image.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdentificationError {
    #[error("Classification model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Classification failed: {0}")]
    InferenceFailed(String),
    #[error("Could not identify image.")]
    NotIdentified,
}

impl From<ModelError> for IdentificationError {
    fn from(error: ModelError) -> Self {
        match error {
            ModelError::Unavailable(message) => Self::ModelUnavailable(message),
            ModelError::Inference(message) => Self::InferenceFailed(message),
        }
    }
}

/// Image to ranked labels. Implementations may block.
pub trait ClassificationModel: Send + Sync {
    fn infer(&self, image: &DynamicImage) -> Result<Vec<(String, f32)>, ModelError>;
}

/// One ranked label.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// Labels ordered by descending confidence; never holds NaN or negative values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationResult {
    entries: Vec<Classification>,
}

impl ClassificationResult {
    /// Sanitizes raw model output into ranked order. Labels with no
    /// printable subject name are dropped.
    pub fn from_raw(raw: Vec<(String, f32)>) -> Self {
        let mut entries: Vec<Classification> = raw
            .into_iter()
            .filter_map(|(label, confidence)| {
                let label = label.trim().to_string();
                if confidence.is_nan() || confidence < 0.0 {
                    return None;
                }
                Subject::from_label(&label)?;
                Some(Classification {
                    label,
                    confidence: confidence.min(1.0),
                })
            })
            .collect();
        entries.sort_by(|left, right| right.confidence.total_cmp(&left.confidence));
        Self { entries }
    }

    pub fn entries(&self) -> &[Classification] {
        &self.entries
    }

    pub fn top(&self) -> Option<&Classification> {
        self.entries.first()
    }
}

/// Human-readable, title-cased name of the classified item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject(String);

impl Subject {
    /// Title-cases `label`; `None` when nothing printable remains.
    pub fn from_label(label: &str) -> Option<Self> {
        let title = title_case_words(label);
        if title.is_empty() {
            None
        } else {
            Some(Self(title))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn title_case_words(value: &str) -> String {
    value
        .split(|ch: char| ch.is_whitespace() || ch == '_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            let Some(first) = chars.next() else {
                return String::new();
            };
            let mut out: String = first.to_uppercase().collect();
            out.push_str(&chars.as_str().to_lowercase());
            out
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs the model once and ranks its output.
pub fn classify(
    model: &dyn ClassificationModel,
    image: &DynamicImage,
) -> Result<ClassificationResult, IdentificationError> {
    let raw = model.infer(image)?;
    Ok(ClassificationResult::from_raw(raw))
}

/// Returns the top-ranked label as a subject, if any.
pub fn top_subject(result: &ClassificationResult) -> Option<Subject> {
    result
        .top()
        .and_then(|entry| Subject::from_label(&entry.label))
}

/// Classification plus confidence gating; one inference attempt, no retries.
pub struct ClassifierAdapter {
    model: Box<dyn ClassificationModel>,
    min_confidence: f32,
}

impl ClassifierAdapter {
    pub fn new(model: Box<dyn ClassificationModel>, min_confidence: f32) -> Self {
        Self {
            model,
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }

    pub fn identify(&self, image: &DynamicImage) -> Result<Subject, IdentificationError> {
        let result = classify(self.model.as_ref(), image)?;
        debug!("Classifier: ranked results {:?}", result.entries());
        match result.top() {
            Some(top) if top.confidence >= self.min_confidence => {
                top_subject(&result).ok_or(IdentificationError::NotIdentified)
            }
            _ => Err(IdentificationError::NotIdentified),
        }
    }
}

/// Model whose output is fixed up front, e.g. labels supplied on the command line.
pub struct PresetLabelModel {
    labels: Vec<(String, f32)>,
}

impl PresetLabelModel {
    pub fn new(labels: Vec<(String, f32)>) -> Self {
        Self { labels }
    }

    /// Parses `label=confidence,label=confidence`; a bare label counts as 1.0.
    pub fn parse_spec(spec: &str) -> Result<Self, String> {
        let mut labels = Vec::new();
        for item in spec.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (label, confidence) = match item.rsplit_once('=') {
                Some((label, raw)) => {
                    let confidence = raw
                        .trim()
                        .parse::<f32>()
                        .map_err(|error| format!("Invalid confidence in '{item}': {error}"))?;
                    (label.trim(), confidence)
                }
                None => (item, 1.0),
            };
            labels.push((label.to_string(), confidence));
        }
        Ok(Self::new(labels))
    }
}

impl ClassificationModel for PresetLabelModel {
    fn infer(&self, image: &DynamicImage) -> Result<Vec<(String, f32)>, ModelError> {
        if self.labels.is_empty() {
            return Err(ModelError::Unavailable(
                "no labels were supplied for this image".to_string(),
            ));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(ModelError::Inference("image has no pixels".to_string()));
        }
        Ok(self.labels.clone())
    }
}
