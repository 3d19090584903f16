//! Record normalization, matching, and conflict detection against the
//! reference mirror.

use std::collections::BTreeMap;

use mindex_core::{Conflict, ExternalRecord, MatchResult, MatchStrategy, ReferenceRecord};
use serde::{Deserialize, Serialize};
use strsim::levenshtein;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "mindex-reconcile";

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Canonical comparison form of a mineral name: NFD-decomposed, combining
/// marks dropped, lowercased, non-alphanumerics stripped.
///
/// Total and deterministic; unparseable input degrades to a (possibly
/// empty) best-effort string rather than failing.
pub fn normalize_name(raw: &str) -> String {
    raw.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Trailing tokens that name a classification level rather than a mineral.
const CLASS_SUFFIX_TOKENS: &[&str] = &["group", "series", "supergroup"];

/// Normalized candidate forms for name matching, primary form first:
/// class-suffix tokens stripped, trailing parenthetical (Levinson-style
/// suffix) stripped, and the base name before the first hyphen/parenthesis.
///
/// Variants only feed candidate lookups; the matcher scores each hit
/// independently, so shared stems never silently merge distinct minerals.
pub fn name_variants(raw: &str) -> Vec<String> {
    let mut variants = vec![normalize_name(raw)];

    let mut push = |candidate: String| {
        let normalized = normalize_name(&candidate);
        if !normalized.is_empty() && !variants.contains(&normalized) {
            variants.push(normalized);
        }
    };

    push(strip_class_suffix(raw));
    push(strip_parenthetical_suffix(raw));

    if let Some(cut) = raw.find(|c| c == '-' || c == '(') {
        push(raw[..cut].to_string());
    }

    variants.retain(|v| !v.is_empty());
    variants
}

fn strip_class_suffix(raw: &str) -> String {
    let mut tokens: Vec<&str> = raw.split_whitespace().collect();
    while let Some(last) = tokens.last() {
        if CLASS_SUFFIX_TOKENS.contains(&last.to_ascii_lowercase().as_str()) {
            tokens.pop();
        } else {
            break;
        }
    }
    tokens.join(" ")
}

fn strip_parenthetical_suffix(raw: &str) -> String {
    let trimmed = raw.trim_end();
    if !trimmed.ends_with(')') {
        return trimmed.to_string();
    }
    let Some(open) = trimmed.rfind('(') else {
        return trimmed.to_string();
    };
    let mut head = &trimmed[..open];
    if head.ends_with('-') {
        head = &head[..head.len() - 1];
    }
    head.trim_end().to_string()
}

/// Canonical comparison form of a chemical formula: whitespace stripped,
/// Unicode sub/superscript digits and signs mapped to ASCII, the middle-dot
/// hydration separators collapsed to `.`, markup tags dropped.
pub fn normalize_formula(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if in_tag => {}
            c if c.is_whitespace() => {}
            '\u{2080}'..='\u{2089}' => {
                out.push(char::from(b'0' + (c as u32 - 0x2080) as u8));
            }
            '\u{2070}' => out.push('0'),
            '\u{00B9}' => out.push('1'),
            '\u{00B2}' => out.push('2'),
            '\u{00B3}' => out.push('3'),
            '\u{2074}'..='\u{2079}' => {
                out.push(char::from(b'4' + (c as u32 - 0x2074) as u8));
            }
            '\u{207A}' | '\u{208A}' => out.push('+'),
            '\u{207B}' | '\u{208B}' => out.push('-'),
            '\u{00B7}' | '\u{2219}' | '\u{22C5}' | '\u{2022}' => out.push('.'),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Classification code builder
// ---------------------------------------------------------------------------

/// Marker for "4th classification level intentionally absent," as opposed
/// to not yet captured.
pub const CLASS_PLACEHOLDER: &str = "x";

fn valid_part(part: Option<&str>) -> Option<&str> {
    let part = part?.trim();
    if part.is_empty() {
        None
    } else {
        Some(part)
    }
}

/// Assembles a hierarchical classification code from up to four ordered
/// parts.
///
/// Parts 2 and 3 together form one sub-level and concatenate without a
/// separator; part 4 is zero-padded to two digits. When parts 1-3 are
/// present but part 4 is absent the code is repaired to end in the
/// `x` placeholder so it never compares equal to a truly four-level code.
pub fn build_code(parts: [Option<&str>; 4]) -> String {
    let p1 = match valid_part(parts[0]) {
        Some("0") | None => return String::new(),
        Some(p) => p,
    };
    let Some(p2) = valid_part(parts[1]) else {
        return p1.to_string();
    };
    let Some(p3) = valid_part(parts[2]) else {
        return format!("{p1}.{p2}");
    };
    match valid_part(parts[3]) {
        Some(p4) if p4 == CLASS_PLACEHOLDER => format!("{p1}.{p2}{p3}.{CLASS_PLACEHOLDER}"),
        Some(p4) => format!("{p1}.{p2}{p3}.{p4:0>2}"),
        None => format!("{p1}.{p2}{p3}.{CLASS_PLACEHOLDER}"),
    }
}

/// True when parts 1-3 are valid but part 4 is neither captured nor the
/// explicit placeholder: the transitional state the sync engine should
/// re-request fresher data for.
pub fn is_incomplete(parts: &[Option<String>; 4]) -> bool {
    let p1 = valid_part(parts[0].as_deref());
    if matches!(p1, Some("0") | None) {
        return false;
    }
    valid_part(parts[1].as_deref()).is_some()
        && valid_part(parts[2].as_deref()).is_some()
        && valid_part(parts[3].as_deref()).is_none()
}

fn code_for_reference(record: &ReferenceRecord) -> String {
    let p = &record.classification_parts;
    build_code([
        p[0].as_deref(),
        p[1].as_deref(),
        p[2].as_deref(),
        p[3].as_deref(),
    ])
}

fn code_for_external(record: &ExternalRecord) -> String {
    let mut parts: [Option<&str>; 4] = [None; 4];
    for (slot, part) in parts.iter_mut().zip(record.classification_parts.iter()) {
        *slot = Some(part.as_str());
    }
    build_code(parts)
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Read access the matcher needs from the mirror. Implemented by the
/// storage crate; kept synchronous because matching is pure lookup work.
pub trait ReferenceLookup {
    fn by_id(&self, id: i64) -> Option<ReferenceRecord>;
    /// Case-insensitive exact match on the canonical name.
    fn by_exact_name(&self, name: &str) -> Option<ReferenceRecord>;
    /// Match against the stored set of normalized name variants.
    fn by_normalized_name(&self, normalized: &str) -> Option<ReferenceRecord>;
    /// Bounded candidate search by normalized-name prefix.
    fn similar_by_name_prefix(&self, prefix: &str, limit: usize) -> Vec<ReferenceRecord>;
    /// Bounded candidate search by normalized-formula prefix.
    fn similar_by_formula_prefix(&self, prefix: &str, limit: usize) -> Vec<ReferenceRecord>;
}

/// Tunable matching parameters. The fuzzy acceptance score and review
/// cutoff are empirically chosen, not derived; keep them configurable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Minimum 0-100 similarity a fuzzy hit must exceed to be accepted.
    pub fuzzy_accept: f64,
    /// Results below this confidence are flagged for human review.
    pub review_cutoff: u8,
    /// Characters of normalized name/formula used to bound candidate search.
    pub fuzzy_prefix_len: usize,
    pub candidate_limit: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            fuzzy_accept: 80.0,
            review_cutoff: 90,
            fuzzy_prefix_len: 4,
            candidate_limit: 25,
        }
    }
}

const CONFIDENCE_EXACT_ID: u8 = 100;
const CONFIDENCE_EXACT_NAME: u8 = 95;
const CONFIDENCE_NORMALIZED_NAME: u8 = 88;
const CONFIDENCE_FORMULA_EXACT: u8 = 80;
const CONFIDENCE_FORMULA_NORMALIZED: u8 = 75;

/// Stateless matching pipeline. Read-only against both the external
/// record and the mirror, so it is safe to share across callers.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    config: MatchConfig,
}

impl Matcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Runs the ordered pipeline and returns the first acceptable hit.
    pub fn match_record(
        &self,
        external: &ExternalRecord,
        lookup: &dyn ReferenceLookup,
    ) -> MatchResult {
        if let Some(id) = plain_positive_id(external.reference_id.as_deref()) {
            if let Some(reference) = lookup.by_id(id) {
                return self.result(external, reference, MatchStrategy::ExactId, CONFIDENCE_EXACT_ID);
            }
        }

        let search_name = external.search_name();

        if let Some(reference) = lookup.by_exact_name(search_name) {
            return self.result(
                external,
                reference,
                MatchStrategy::ExactName,
                CONFIDENCE_EXACT_NAME,
            );
        }

        for variant in name_variants(search_name) {
            if let Some(reference) = lookup.by_normalized_name(&variant) {
                return self.result(
                    external,
                    reference,
                    MatchStrategy::NormalizedName,
                    CONFIDENCE_NORMALIZED_NAME,
                );
            }
        }

        if let Some((reference, score)) = self.fuzzy_candidate(search_name, lookup) {
            return self.result(external, reference, MatchStrategy::FuzzyName, score);
        }

        if let Some((reference, confidence)) = self.formula_candidate(external, lookup) {
            return self.result(external, reference, MatchStrategy::Formula, confidence);
        }

        MatchResult {
            external: external.clone(),
            reference: None,
            strategy: MatchStrategy::None,
            confidence: 0,
            conflicts: Vec::new(),
            needs_review: false,
        }
    }

    fn fuzzy_candidate(
        &self,
        search_name: &str,
        lookup: &dyn ReferenceLookup,
    ) -> Option<(ReferenceRecord, u8)> {
        let normalized = normalize_name(search_name);
        if normalized.is_empty() {
            return None;
        }
        let prefix: String = normalized
            .chars()
            .take(self.config.fuzzy_prefix_len)
            .collect();

        let mut best: Option<(ReferenceRecord, f64)> = None;
        for candidate in lookup.similar_by_name_prefix(&prefix, self.config.candidate_limit) {
            let score = name_similarity(&normalized, &normalize_name(&candidate.canonical_name));
            if score > self.config.fuzzy_accept
                && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true)
            {
                best = Some((candidate, score));
            }
        }
        best.map(|(record, score)| (record, score.round().min(100.0) as u8))
    }

    fn formula_candidate(
        &self,
        external: &ExternalRecord,
        lookup: &dyn ReferenceLookup,
    ) -> Option<(ReferenceRecord, u8)> {
        let raw = external.formula.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let normalized = normalize_formula(raw);
        let prefix: String = normalized
            .chars()
            .take(self.config.fuzzy_prefix_len)
            .collect();
        let candidates = lookup.similar_by_formula_prefix(&prefix, self.config.candidate_limit);

        if let Some(exact) = candidates
            .iter()
            .find(|c| c.best_formula().map(str::trim) == Some(raw))
        {
            return Some((exact.clone(), CONFIDENCE_FORMULA_EXACT));
        }
        candidates
            .into_iter()
            .find(|c| {
                c.best_formula()
                    .map(|f| normalize_formula(f) == normalized)
                    .unwrap_or(false)
            })
            .map(|record| (record, CONFIDENCE_FORMULA_NORMALIZED))
    }

    fn result(
        &self,
        external: &ExternalRecord,
        reference: ReferenceRecord,
        strategy: MatchStrategy,
        confidence: u8,
    ) -> MatchResult {
        let conflicts = detect_conflicts(external, &reference);
        // The review flag follows the strategy's nominal confidence, not
        // the per-record score: a lucky high-scoring fuzzy hit is still a
        // fuzzy hit.
        let floor = match strategy {
            MatchStrategy::ExactId => CONFIDENCE_EXACT_ID,
            MatchStrategy::ExactName => CONFIDENCE_EXACT_NAME,
            MatchStrategy::NormalizedName => CONFIDENCE_NORMALIZED_NAME,
            MatchStrategy::FuzzyName => self.config.fuzzy_accept.round() as u8,
            MatchStrategy::Formula => confidence,
            MatchStrategy::None => 0,
        };
        MatchResult {
            external: external.clone(),
            reference: Some(reference),
            strategy,
            confidence,
            conflicts,
            needs_review: floor < self.config.review_cutoff,
        }
    }
}

/// Parses an external reference id only when it is a plain positive
/// integer. Placeholder tokens (`pending-1043`, `?`) fall through to the
/// name-based strategies.
pub fn plain_positive_id(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i64>().ok().filter(|id| *id > 0)
}

/// Normalized edit-distance similarity on a 0-100 scale.
fn name_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    (1.0 - levenshtein(a, b) as f64 / max_len as f64) * 100.0
}

// ---------------------------------------------------------------------------
// Conflict detector
// ---------------------------------------------------------------------------

/// Compares the fixed set of comparable fields and reports every pair that
/// is populated on both sides yet differs after normalization. Absence is
/// never a contradiction, and no winner is chosen here.
pub fn detect_conflicts(external: &ExternalRecord, reference: &ReferenceRecord) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    push_conflict(
        &mut conflicts,
        "formula",
        external.formula.as_deref(),
        reference.best_formula(),
        |v| normalize_formula(v),
    );

    let external_code = code_for_external(external);
    let reference_code = code_for_reference(reference);
    if !external_code.is_empty() && !reference_code.is_empty() && external_code != reference_code {
        conflicts.push(Conflict {
            field: "classification".to_string(),
            external_value: external_code,
            reference_value: reference_code,
        });
    }

    let properties: [(&str, Option<&str>, Option<&str>); 5] = [
        ("color", external.color.as_deref(), reference.color.as_deref()),
        (
            "luster",
            external.luster.as_deref(),
            reference.luster.as_deref(),
        ),
        (
            "streak",
            external.streak.as_deref(),
            reference.streak.as_deref(),
        ),
        (
            "crystal_system",
            external.crystal_system.as_deref(),
            reference.crystal_system.as_deref(),
        ),
        (
            "hardness",
            external.hardness.as_deref(),
            reference.hardness.as_deref(),
        ),
    ];
    for (field, ext, refv) in properties {
        push_conflict(&mut conflicts, field, ext, refv, |v| {
            v.trim().to_lowercase()
        });
    }

    conflicts
}

fn push_conflict(
    conflicts: &mut Vec<Conflict>,
    field: &str,
    external: Option<&str>,
    reference: Option<&str>,
    normalize: impl Fn(&str) -> String,
) {
    let (Some(ext), Some(refv)) = (external, reference) else {
        return;
    };
    if ext.trim().is_empty() || refv.trim().is_empty() {
        return;
    }
    if normalize(ext) != normalize(refv) {
        conflicts.push(Conflict {
            field: field.to_string(),
            external_value: ext.to_string(),
            reference_value: refv.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Batch reconciliation
// ---------------------------------------------------------------------------

/// Aggregate outcome of reconciling one external dataset against the
/// mirror, sized for a request/response or CLI wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub total: usize,
    pub by_strategy: BTreeMap<&'static str, usize>,
    pub needs_review: usize,
    pub with_conflicts: usize,
    pub unmatched: usize,
    pub results: Vec<MatchResult>,
}

/// Matches every record in order. Read-only; safe to run concurrently
/// with other readers of the same mirror.
pub fn reconcile<I>(records: I, lookup: &dyn ReferenceLookup, matcher: &Matcher) -> ReconcileReport
where
    I: IntoIterator<Item = ExternalRecord>,
{
    let mut report = ReconcileReport {
        total: 0,
        by_strategy: BTreeMap::new(),
        needs_review: 0,
        with_conflicts: 0,
        unmatched: 0,
        results: Vec::new(),
    };

    for record in records {
        let result = matcher.match_record(&record, lookup);
        report.total += 1;
        *report.by_strategy.entry(result.strategy.as_str()).or_default() += 1;
        if result.needs_review {
            report.needs_review += 1;
        }
        if !result.conflicts.is_empty() {
            report.with_conflicts += 1;
        }
        if result.strategy == MatchStrategy::None {
            report.unmatched += 1;
        }
        report.results.push(result);
    }

    report
}
