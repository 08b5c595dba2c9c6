//! Clinical form state and the serializers that turn it into the context
//! snapshot attached to each outgoing message.

use serde::{Deserialize, Serialize};

pub const FEATURE_CHAT: &str = "chat";
pub const FEATURE_TRIAGE: &str = "triage";
pub const FEATURE_VITALS: &str = "vitals";
pub const FEATURE_COMPLAINTS: &str = "complaints";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub label: String,
    pub value: String,
}

/// Ordered, labelled form fields as the call site currently holds them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalForm {
    fields: Vec<FormField>,
}

impl ClinicalForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`ClinicalForm::set`].
    pub fn with(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(label, value);
        self
    }

    /// Set a field, keeping its original position when it already exists.
    pub fn set(&mut self, label: impl Into<String>, value: impl Into<String>) {
        let label = label.into();
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.label == label) {
            Some(field) => field.value = value,
            None => self.fields.push(FormField { label, value }),
        }
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.label == label)
            .map(|f| f.value.as_str())
    }

    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }
}

/// Derives a context snapshot from form state. Must be deterministic.
pub trait ContextSerializer: Send + Sync {
    fn serialize(&self, form: &ClinicalForm) -> String;
}

impl<F> ContextSerializer for F
where
    F: Fn(&ClinicalForm) -> String + Send + Sync,
{
    fn serialize(&self, form: &ClinicalForm) -> String {
        self(form)
    }
}

/// One `Label: value` line per non-empty field, optionally restricted to a
/// set of labels and preceded by a heading.
#[derive(Debug, Clone, Default)]
pub struct LabeledFieldsSerializer {
    heading: Option<String>,
    labels: Option<Vec<String>>,
}

impl LabeledFieldsSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heading(mut self, heading: impl Into<String>) -> Self {
        self.heading = Some(heading.into());
        self
    }

    /// Only these labels, in this order.
    pub fn only<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }
}

impl ContextSerializer for LabeledFieldsSerializer {
    fn serialize(&self, form: &ClinicalForm) -> String {
        let fields: Vec<(&str, &str)> = match &self.labels {
            Some(labels) => labels
                .iter()
                .filter_map(|label| form.get(label).map(|value| (label.as_str(), value)))
                .collect(),
            None => form
                .fields()
                .iter()
                .map(|f| (f.label.as_str(), f.value.as_str()))
                .collect(),
        };

        let lines: Vec<String> = fields
            .into_iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(label, value)| format!("{}: {}", label, value.trim()))
            .collect();
        if lines.is_empty() {
            return String::new();
        }

        match &self.heading {
            Some(heading) => format!("{}\n{}", heading, lines.join("\n")),
            None => lines.join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> ClinicalForm {
        ClinicalForm::new()
            .with("Species", "Canine")
            .with("Weight", "5kg")
            .with("Temperature", "")
            .with("Heart rate", "120 bpm")
    }

    #[test]
    fn test_set_keeps_position() {
        let mut form = form();
        form.set("Species", "Feline");
        assert_eq!(form.fields()[0].value, "Feline");
        assert_eq!(form.fields().len(), 4);
    }

    #[test]
    fn test_labeled_fields_skip_empty_values() {
        let serializer = LabeledFieldsSerializer::new();
        assert_eq!(
            serializer.serialize(&form()),
            "Species: Canine\nWeight: 5kg\nHeart rate: 120 bpm"
        );
    }

    #[test]
    fn test_whitelist_and_heading() {
        let serializer = LabeledFieldsSerializer::new()
            .heading("Vitals")
            .only(["Heart rate", "Weight", "Respiratory rate"]);
        assert_eq!(serializer.serialize(&form()), "Vitals\nHeart rate: 120 bpm\nWeight: 5kg");
    }

    #[test]
    fn test_heading_omitted_when_nothing_to_report() {
        let serializer = LabeledFieldsSerializer::new().heading("Vitals");
        assert_eq!(serializer.serialize(&ClinicalForm::new()), "");
    }

    #[test]
    fn test_closure_serializer() {
        let serializer = |form: &ClinicalForm| format!("W={}", form.get("Weight").unwrap_or("?"));
        assert_eq!(serializer.serialize(&form()), "W=5kg");
    }
}
