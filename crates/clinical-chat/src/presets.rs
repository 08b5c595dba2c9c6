//! Engine builders for the four clinical call sites. They differ only in
//! feature tag and which form fields end up in the context snapshot.

use crate::context::{LabeledFieldsSerializer, FEATURE_CHAT, FEATURE_COMPLAINTS, FEATURE_TRIAGE, FEATURE_VITALS};
use crate::engine::ChatEngineBuilder;

/// General assistant: every non-empty field of the patient record.
pub fn general() -> ChatEngineBuilder {
    ChatEngineBuilder::new(FEATURE_CHAT).context_serializer(LabeledFieldsSerializer::new().heading("Patient context"))
}

pub fn triage() -> ChatEngineBuilder {
    ChatEngineBuilder::new(FEATURE_TRIAGE).context_serializer(
        LabeledFieldsSerializer::new().heading("Triage assessment").only([
            "Species",
            "Breed",
            "Age",
            "Weight",
            "Presenting complaint",
            "Triage level",
            "Notes",
        ]),
    )
}

pub fn vitals() -> ChatEngineBuilder {
    ChatEngineBuilder::new(FEATURE_VITALS).context_serializer(
        LabeledFieldsSerializer::new().heading("Vital signs").only([
            "Weight",
            "Temperature",
            "Heart rate",
            "Respiratory rate",
            "Capillary refill time",
            "Mucous membranes",
            "Blood pressure",
        ]),
    )
}

pub fn complaints() -> ChatEngineBuilder {
    ChatEngineBuilder::new(FEATURE_COMPLAINTS).context_serializer(
        LabeledFieldsSerializer::new().heading("Presenting complaints").only([
            "Chief complaint",
            "Onset",
            "Duration",
            "Symptoms",
            "Medical history",
        ]),
    )
}
