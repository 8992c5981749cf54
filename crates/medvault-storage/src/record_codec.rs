//! Whitelist-driven record encryption
//!
//! Each record kind carries its own explicit set of sensitive columns.
//! Nothing outside that set is ever encrypted, and a column that is sensitive
//! on one table says nothing about a same-named column on another.

use crate::encryption::FieldCipher;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A database row as a JSON object
pub type Record = serde_json::Map<String, Value>;

/// Kind of record persisted with encrypted columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Patient profile
    Patient,
    /// Healthcare provider
    Provider,
    /// Treatment course
    Treatment,
    /// Medication entry
    Medication,
    /// Research paper or clinical trial
    Research,
}

impl RecordKind {
    /// Columns holding PHI for this kind
    pub fn sensitive_fields(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Patient => &[
                "name",
                "email",
                "phone",
                "address",
                "medical_history",
                "notes",
            ],
            RecordKind::Provider => &["name", "email", "phone", "address", "notes"],
            RecordKind::Treatment => &["treatment_name", "doctor_name", "hospital_name", "notes"],
            RecordKind::Medication => &["medication_details", "notes"],
            RecordKind::Research => &["study_details", "trial_notes"],
        }
    }

    /// Table the kind is stored in
    pub fn table_name(&self) -> &'static str {
        match self {
            RecordKind::Patient => "patients",
            RecordKind::Provider => "providers",
            RecordKind::Treatment => "treatments",
            RecordKind::Medication => "medications",
            RecordKind::Research => "research_papers",
        }
    }

    /// Look up the kind stored in `table`
    pub fn for_table(table: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.table_name() == table)
    }

    /// All kinds
    pub fn all() -> &'static [RecordKind] {
        &[
            RecordKind::Patient,
            RecordKind::Provider,
            RecordKind::Treatment,
            RecordKind::Medication,
            RecordKind::Research,
        ]
    }

    /// Whether `field` is sensitive for this kind
    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive_fields().contains(&field)
    }
}

/// Result of decrypting a record, including the fields that were nulled
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    /// Record with sensitive fields in plaintext
    pub record: Record,
    /// Sensitive fields that failed to decrypt and were set to null
    pub failed_fields: Vec<&'static str>,
}

/// Applies [`FieldCipher`] to the sensitive columns of a record
#[derive(Debug, Clone)]
pub struct RecordCodec {
    cipher: FieldCipher,
}

impl RecordCodec {
    /// Create a codec around a field cipher
    pub fn new(cipher: FieldCipher) -> Self {
        Self { cipher }
    }

    /// Underlying field cipher
    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    /// Encrypt the sensitive fields of `record` before INSERT/UPDATE.
    ///
    /// Missing, null and empty fields are left untouched. A sensitive field
    /// that holds a non-string value is refused rather than stored in the
    /// clear.
    pub fn encrypt_record(&self, kind: RecordKind, record: &Record) -> Result<Record> {
        let mut out = record.clone();
        for &field in kind.sensitive_fields() {
            let Some(value) = out.get_mut(field) else {
                continue;
            };
            match value {
                Value::Null => {}
                Value::String(text) if text.is_empty() => {}
                Value::String(text) => {
                    *value = Value::String(self.cipher.encrypt_str(text)?);
                }
                other => {
                    return Err(Error::Validation(format!(
                        "Sensitive field '{}' on {:?} must be a string, got {}",
                        field,
                        kind,
                        json_type_name(other)
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Decrypt the sensitive fields of `record` after SELECT.
    ///
    /// Fields that fail to decrypt come back as null.
    pub fn decrypt_record(&self, kind: RecordKind, record: &Record) -> Record {
        self.decrypt_record_with_report(kind, record).record
    }

    /// Decrypt and report which fields could not be recovered.
    pub fn decrypt_record_with_report(&self, kind: RecordKind, record: &Record) -> DecryptOutcome {
        let mut out = record.clone();
        let mut failed_fields = Vec::new();

        for &field in kind.sensitive_fields() {
            let Some(value) = out.get_mut(field) else {
                continue;
            };
            let decrypted = match &*value {
                Value::Null => continue,
                Value::String(blob) if blob.is_empty() => continue,
                Value::String(blob) => self.cipher.decrypt_str(blob),
                other => Err(Error::Validation(format!(
                    "expected encrypted string, got {}",
                    json_type_name(other)
                ))),
            };

            match decrypted {
                Ok(plaintext) => *value = Value::String(plaintext),
                Err(e) => {
                    tracing::warn!(
                        field,
                        kind = ?kind,
                        error = %e,
                        "Failed to decrypt field, returning null"
                    );
                    *value = Value::Null;
                    failed_fields.push(field);
                }
            }
        }

        DecryptOutcome {
            record: out,
            failed_fields,
        }
    }

    /// Decrypt every row of a query result.
    pub fn decrypt_records(&self, kind: RecordKind, records: &[Record]) -> Vec<Record> {
        records
            .iter()
            .map(|r| self.decrypt_record(kind, r))
            .collect()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
