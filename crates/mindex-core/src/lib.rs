//! Core domain model for the mineral reference mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "mindex-core";

/// One row from the third-party spreadsheet export being reconciled.
///
/// Immutable input: the engine never writes back into it. `reference_id`
/// is kept as the raw string because the export mixes real numeric ids
/// with placeholder tokens such as `pending-1043`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExternalRecord {
    pub title: String,
    pub reference_id: Option<String>,
    pub formula: Option<String>,
    pub classification_parts: Vec<String>,
    pub color: Option<String>,
    pub luster: Option<String>,
    pub streak: Option<String>,
    pub crystal_system: Option<String>,
    pub hardness: Option<String>,
    pub variety_of_name: Option<String>,
    pub synonym_of_name: Option<String>,
}

impl ExternalRecord {
    /// Name the matching pipeline should search under. Varieties and
    /// synonyms carry their own title verbatim but match against the
    /// parent mineral's name.
    pub fn search_name(&self) -> &str {
        self.variety_of_name
            .as_deref()
            .or(self.synonym_of_name.as_deref())
            .unwrap_or(&self.title)
    }
}

/// Either another record's id or free text, as the reference source
/// reports polytype parentage both ways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolytypeRef {
    Id(i64),
    Text(String),
}

/// One row of the local mirror of the reference source.
///
/// `reference_id` is immutable once assigned; only the sync engine
/// mutates the rest. `content_hash` must always equal
/// [`ReferenceRecord::compute_content_hash`] over the current salient
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub reference_id: i64,
    pub canonical_name: String,
    /// Display formula, preferred over `formula_plain` when both exist.
    pub formula: Option<String>,
    pub formula_plain: Option<String>,
    pub classification_parts: [Option<String>; 4],
    pub status: String,
    pub color: Option<String>,
    pub luster: Option<String>,
    pub streak: Option<String>,
    pub crystal_system: Option<String>,
    pub hardness: Option<String>,
    pub variety_of: Option<i64>,
    pub group_id: Option<i64>,
    pub synonym_of: Option<i64>,
    pub polytype_of: Option<PolytypeRef>,
    pub content_hash: String,
    pub last_synced_at: DateTime<Utc>,
}

impl ReferenceRecord {
    /// Highest-precedence formula present, if any.
    pub fn best_formula(&self) -> Option<&str> {
        self.formula.as_deref().or(self.formula_plain.as_deref())
    }

    /// Digest over the salient fields, canonicalized by field name so the
    /// hash is independent of assignment order. Two records whose salient
    /// fields agree hash identically; changing any one of them changes
    /// the hash.
    pub fn compute_content_hash(&self) -> String {
        let mut fields: Vec<(&str, String)> = vec![
            ("canonical_name", self.canonical_name.clone()),
            ("formula", self.formula.clone().unwrap_or_default()),
            (
                "formula_plain",
                self.formula_plain.clone().unwrap_or_default(),
            ),
            ("status", self.status.clone()),
            ("color", self.color.clone().unwrap_or_default()),
            ("luster", self.luster.clone().unwrap_or_default()),
            ("streak", self.streak.clone().unwrap_or_default()),
            (
                "crystal_system",
                self.crystal_system.clone().unwrap_or_default(),
            ),
            ("hardness", self.hardness.clone().unwrap_or_default()),
        ];
        for (i, part) in self.classification_parts.iter().enumerate() {
            let key: &'static str = match i {
                0 => "class_1",
                1 => "class_2",
                2 => "class_3",
                _ => "class_4",
            };
            fields.push((key, part.clone().unwrap_or_default()));
        }
        fields.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for (name, value) in &fields {
            hasher.update(name.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.as_bytes());
            hasher.update([0x1e]);
        }
        hex::encode(hasher.finalize())
    }

    /// Recomputes and stores the hash. Call after any salient-field edit.
    pub fn refresh_content_hash(&mut self) {
        self.content_hash = self.compute_content_hash();
    }
}

/// Which step of the matching pipeline produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStrategy {
    ExactId,
    ExactName,
    NormalizedName,
    FuzzyName,
    Formula,
    None,
}

impl MatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::ExactId => "exact-id",
            MatchStrategy::ExactName => "exact-name",
            MatchStrategy::NormalizedName => "normalized-name",
            MatchStrategy::FuzzyName => "fuzzy-name",
            MatchStrategy::Formula => "formula",
            MatchStrategy::None => "none",
        }
    }
}

/// Field-level discrepancy between an external record and its matched
/// reference record. Carries both values verbatim; resolution is a
/// downstream decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub field: String,
    pub external_value: String,
    pub reference_value: String,
}

/// Outcome of matching one external record against the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub external: ExternalRecord,
    pub reference: Option<ReferenceRecord>,
    pub strategy: MatchStrategy,
    /// 0-100.
    pub confidence: u8,
    pub conflicts: Vec<Conflict>,
    pub needs_review: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Updated,
    Deleted,
}

/// Append-only sync audit entry. A reference id may accumulate many of
/// these over its lifetime (deleted ids can reappear as new).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub reference_id: i64,
    pub kind: ChangeKind,
    pub detected_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn now(reference_id: i64, kind: ChangeKind) -> Self {
        Self {
            reference_id,
            kind,
            detected_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: i64, name: &str) -> ReferenceRecord {
        let mut rec = ReferenceRecord {
            reference_id: id,
            canonical_name: name.to_string(),
            formula: Some("SiO2".to_string()),
            formula_plain: None,
            classification_parts: [
                Some("4".into()),
                Some("D".into()),
                Some("A".into()),
                Some("05".into()),
            ],
            status: "approved".to_string(),
            color: Some("colorless".to_string()),
            luster: None,
            streak: None,
            crystal_system: Some("trigonal".to_string()),
            hardness: Some("7".to_string()),
            variety_of: None,
            group_id: None,
            synonym_of: None,
            polytype_of: None,
            content_hash: String::new(),
            last_synced_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        };
        rec.refresh_content_hash();
        rec
    }

    #[test]
    fn identical_salient_fields_hash_identically() {
        let a = record(3337, "Quartz");
        // Assign fields in a different order via struct update syntax.
        let mut b = ReferenceRecord {
            canonical_name: "Quartz".to_string(),
            ..record(3337, "placeholder")
        };
        b.refresh_content_hash();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn changing_any_salient_field_changes_hash() {
        let base = record(3337, "Quartz");
        let mut renamed = base.clone();
        renamed.canonical_name = "Quarz".to_string();
        renamed.refresh_content_hash();
        assert_ne!(base.content_hash, renamed.content_hash);

        let mut reclassified = base.clone();
        reclassified.classification_parts[3] = Some("06".into());
        reclassified.refresh_content_hash();
        assert_ne!(base.content_hash, reclassified.content_hash);

        let mut restatused = base.clone();
        restatused.status = "discredited".to_string();
        restatused.refresh_content_hash();
        assert_ne!(base.content_hash, restatused.content_hash);
    }

    #[test]
    fn non_salient_fields_do_not_affect_hash() {
        let base = record(3337, "Quartz");
        let mut touched = base.clone();
        touched.last_synced_at = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).single().unwrap();
        touched.group_id = Some(29229);
        assert_eq!(base.content_hash, touched.compute_content_hash());
    }

    #[test]
    fn search_name_prefers_parent_hints() {
        let plain = ExternalRecord {
            title: "Amethyst".to_string(),
            ..Default::default()
        };
        assert_eq!(plain.search_name(), "Amethyst");

        let variety = ExternalRecord {
            title: "Amethyst".to_string(),
            variety_of_name: Some("Quartz".to_string()),
            ..Default::default()
        };
        assert_eq!(variety.search_name(), "Quartz");

        let synonym = ExternalRecord {
            title: "Adamite".to_string(),
            synonym_of_name: Some("Adamite-Zn".to_string()),
            ..Default::default()
        };
        assert_eq!(synonym.search_name(), "Adamite-Zn");
    }

    #[test]
    fn best_formula_precedence() {
        let mut rec = record(1, "Test");
        rec.formula = Some("CaCO<sub>3</sub>".to_string());
        rec.formula_plain = Some("CaCO3".to_string());
        assert_eq!(rec.best_formula(), Some("CaCO<sub>3</sub>"));
        rec.formula = None;
        assert_eq!(rec.best_formula(), Some("CaCO3"));
    }
}
