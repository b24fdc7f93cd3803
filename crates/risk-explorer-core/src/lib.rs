use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// How many entries the ranked leaderboards keep.
pub const TOP_RANKED_LIMIT: usize = 20;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ExplorerError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// A sample or entity identifier as it arrives from the data feeds.
///
/// The three source documents do not agree on key typing: sample records
/// usually carry numeric ids while the context and explanation maps are keyed
/// by the stringified form. Both representations are kept as-is and bridged
/// at lookup time by [`resolve`] and [`Ident::matches`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(untagged)]
pub enum Ident {
    Num(i64),
    Text(String),
}

impl Ident {
    /// Canonical string form shared by both representations.
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Num(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }

    /// Lenient equality across representations: `Num(7)` matches `Text("7")`.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self == other || self.as_text() == other.as_text()
    }
}

impl Display for Ident {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for Ident {
    fn from(value: i64) -> Self {
        Self::Num(value)
    }
}

impl From<&str> for Ident {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Look up a value keyed by sample identifier, tolerating mismatched key
/// typing between the sample collection and the map.
///
/// Attempts the exact key first, then the identifier coerced to its alternate
/// representation. Returns `None` only when every attempt misses; absence is
/// a valid state (a sample with no recorded context), never an error.
#[must_use]
pub fn resolve<'a, T>(map: &'a BTreeMap<Ident, T>, id: &Ident) -> Option<&'a T> {
    if let Some(value) = map.get(id) {
        return Some(value);
    }
    match id {
        Ident::Num(_) => map.get(&Ident::Text(id.as_text())),
        Ident::Text(text) => text.parse::<i64>().ok().and_then(|num| map.get(&Ident::Num(num))),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[serde(alias = "高风险")]
    High,
    #[serde(alias = "中风险")]
    Medium,
    #[serde(alias = "低风险")]
    Low,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" | "高风险" => Some(Self::High),
            "medium" | "中风险" => Some(Self::Medium),
            "low" | "低风险" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    #[serde(alias = "合格")]
    Qualified,
    #[serde(alias = "不合格")]
    Unqualified,
}

impl Label {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qualified => "qualified",
            Self::Unqualified => "unqualified",
        }
    }
}

/// Top-level hard partition of the dataset, and the value domain of the
/// derived analysis mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    All,
    Risk,
    Safe,
}

impl ViewMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Risk => "risk",
            Self::Safe => "safe",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "risk" => Some(Self::Risk),
            "safe" => Some(Self::Safe),
            _ => None,
        }
    }
}

/// One scored record under analysis, positioned in a 2D embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub id: Ident,
    pub x: f64,
    pub y: f64,
    pub score: f64,
    pub label: Label,
    #[serde(rename = "riskLevel")]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_city: Option<String>,
}

impl Sample {
    /// Validate one loaded sample record.
    ///
    /// # Errors
    /// Returns [`ExplorerError::Validation`] when the identifier is empty or
    /// the score is not a finite number.
    pub fn validate(&self) -> Result<(), ExplorerError> {
        if let Ident::Text(text) = &self.id {
            if text.trim().is_empty() {
                return Err(ExplorerError::Validation(
                    "sample id MUST be non-empty".to_string(),
                ));
            }
        }

        if !self.score.is_finite() {
            return Err(ExplorerError::Validation(format!(
                "sample {} score MUST be a finite number",
                self.id
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmer_vol: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_vol: Option<f64>,
}

/// The related entities linked to one sample. Any array may be empty; a
/// sample may have no recorded context at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextData {
    #[serde(default)]
    pub products: Vec<Ident>,
    #[serde(default)]
    pub markets: Vec<Ident>,
    #[serde(default)]
    pub farmers: Vec<Ident>,
    #[serde(default)]
    pub contaminants: Vec<Ident>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ContextStats>,
}

impl ContextData {
    #[must_use]
    pub fn entities_of(&self, kind: EntityKind) -> &[Ident] {
        match kind {
            EntityKind::Product => &self.products,
            EntityKind::Market => &self.markets,
            EntityKind::Farmer => &self.farmers,
            EntityKind::Contaminant => &self.contaminants,
        }
    }

    /// All entity references across every typed array.
    pub fn all_entities(&self) -> impl Iterator<Item = (EntityKind, &Ident)> {
        EntityKind::ALL
            .iter()
            .flat_map(|kind| self.entities_of(*kind).iter().map(|id| (*kind, id)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    Market,
    Farmer,
    Contaminant,
}

impl EntityKind {
    pub const ALL: [Self; 4] = [Self::Product, Self::Market, Self::Farmer, Self::Contaminant];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Market => "market",
            Self::Farmer => "farmer",
            Self::Contaminant => "contaminant",
        }
    }

    /// The capitalized token used in `Kind[id]` node and pivot strings.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Product => "Product",
            Self::Market => "Market",
            Self::Farmer => "Farmer",
            Self::Contaminant => "Contaminant",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| value.eq_ignore_ascii_case(kind.token()))
    }
}

/// A typed entity reference, the structured form of a `Kind[id]` token.
///
/// Used both by the pivot cross-filter and for node-category detection in
/// explanation chains.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Ident,
}

impl EntityRef {
    /// Parse a `Kind[id]` token. Returns `None` for anything malformed or
    /// for an unknown kind; callers treat that as "no reference", never as
    /// an error.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        let open = token.find('[')?;
        if !token.ends_with(']') || open + 1 >= token.len() - 1 {
            return None;
        }
        let kind = EntityKind::parse(&token[..open])?;
        let raw = &token[open + 1..token.len() - 1];
        let id = raw
            .parse::<i64>()
            .map_or_else(|_| Ident::Text(raw.to_string()), Ident::Num);
        Some(Self { kind, id })
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind.token(), self.id)
    }
}

/// One link in a causal-explanation chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExplanationLink {
    pub from: String,
    pub to: String,
    pub relation: String,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_label: Option<String>,
}

impl ExplanationLink {
    /// Whether either endpoint of this link refers to an entity of `kind`.
    ///
    /// Endpoint tokens are parsed structurally (`Kind[id]`); only when
    /// neither endpoint parses do we fall back to a substring check against
    /// the display labels, so feeds that never encoded kinds in node ids
    /// keep scoring the same way.
    #[must_use]
    pub fn mentions(&self, kind: EntityKind) -> bool {
        let from_kind = EntityRef::parse(&self.from).map(|node| node.kind);
        let to_kind = EntityRef::parse(&self.to).map(|node| node.kind);
        if from_kind.is_some() || to_kind.is_some() {
            return from_kind == Some(kind) || to_kind == Some(kind);
        }

        let token = kind.token();
        [self.from_label.as_deref(), self.to_label.as_deref()]
            .into_iter()
            .flatten()
            .any(|label| label.contains(token))
    }
}

/// An ordered causal path explaining why a sample received its score.
pub type ExplanationChain = Vec<ExplanationLink>;

/// Soft filter configuration. An empty allowlist means "no restriction",
/// not "exclude all"; the score range is inclusive on both bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterOptions {
    pub risk_levels: BTreeSet<RiskLevel>,
    pub score_threshold: (f64, f64),
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self { risk_levels: BTreeSet::new(), score_threshold: (0.0, 1.0) }
    }
}

/// The complete interactive state the derivation pipeline consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterState {
    pub view_mode: ViewMode,
    pub options: FilterOptions,
    pub search_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<Ident>,
}

/// Find a sample by identifier, tolerating mismatched representations.
#[must_use]
pub fn find_sample<'a>(samples: &'a [Sample], id: &Ident) -> Option<&'a Sample> {
    samples.iter().find(|sample| sample.id.matches(id))
}

/// Apply the view-mode hard filter and the conjunctive soft filters.
///
/// Pure: the result is always a subset of `samples` in original order.
#[must_use]
pub fn filtered_samples<'a>(
    samples: &'a [Sample],
    context: &BTreeMap<Ident, ContextData>,
    state: &FilterState,
) -> Vec<&'a Sample> {
    let (min_score, max_score) = state.options.score_threshold;

    samples
        .iter()
        .filter(|sample| match state.view_mode {
            ViewMode::All => true,
            ViewMode::Safe => sample.risk_level == RiskLevel::Low,
            ViewMode::Risk => sample.risk_level != RiskLevel::Low,
        })
        .filter(|sample| {
            state.options.risk_levels.is_empty()
                || state.options.risk_levels.contains(&sample.risk_level)
        })
        .filter(|sample| (min_score..=max_score).contains(&sample.score))
        .filter(|sample| {
            state.search_query.is_empty()
                || sample.id.as_text().contains(&state.search_query)
                || sample.name.contains(&state.search_query)
        })
        .filter(|sample| {
            state
                .province
                .as_ref()
                .is_none_or(|province| sample.production_province.as_ref() == Some(province))
        })
        .filter(|sample| {
            state.pivot.as_ref().is_none_or(|pivot| {
                resolve(context, &sample.id).is_some_and(|ctx| {
                    ctx.entities_of(pivot.kind)
                        .iter()
                        .any(|entity| entity.matches(&pivot.id))
                })
            })
        })
        .collect()
}

/// Top 20 anomalous samples: risk level above low, descending by score.
/// Ties keep original relative order (stable sort).
#[must_use]
pub fn top_ranked_anomalies<'a>(filtered: &[&'a Sample]) -> Vec<&'a Sample> {
    let mut ranked: Vec<&Sample> = filtered
        .iter()
        .copied()
        .filter(|sample| sample.risk_level != RiskLevel::Low)
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    ranked.truncate(TOP_RANKED_LIMIT);
    ranked
}

/// Top 20 safe samples: low risk only, ascending by score (lower = safer).
#[must_use]
pub fn top_ranked_safe_samples<'a>(filtered: &[&'a Sample]) -> Vec<&'a Sample> {
    let mut ranked: Vec<&Sample> = filtered
        .iter()
        .copied()
        .filter(|sample| sample.risk_level == RiskLevel::Low)
        .collect();
    ranked.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal));
    ranked.truncate(TOP_RANKED_LIMIT);
    ranked
}

/// Resolve the effective risk/safety framing.
///
/// A selected sample's actual risk level overrides the user's chosen view
/// mode; without a selection the view mode is authoritative.
#[must_use]
pub fn analysis_mode(samples: &[Sample], selected: Option<&Ident>, view_mode: ViewMode) -> ViewMode {
    if let Some(id) = selected {
        if let Some(sample) = find_sample(samples, id) {
            return if sample.risk_level == RiskLevel::Low {
                ViewMode::Safe
            } else {
                ViewMode::Risk
            };
        }
    }
    view_mode
}

/// The leaderboard the control panel should display for `mode`: the safe
/// list when the mode resolves to safe, the anomaly list otherwise (the
/// risk view is the default framing under `all`).
#[must_use]
pub fn current_display_list<'a>(filtered: &[&'a Sample], mode: ViewMode) -> Vec<&'a Sample> {
    match mode {
        ViewMode::Safe => top_ranked_safe_samples(filtered),
        ViewMode::All | ViewMode::Risk => top_ranked_anomalies(filtered),
    }
}

/// Frequency of each context entity across the risky samples of `filtered`,
/// keyed by the composite `Kind[id]` string.
#[must_use]
pub fn entity_risk_map(
    filtered: &[&Sample],
    context: &BTreeMap<Ident, ContextData>,
) -> BTreeMap<String, u64> {
    entity_frequency_map(filtered, context, |sample| sample.risk_level != RiskLevel::Low)
}

/// Frequency of each context entity across the safe samples of `filtered`.
#[must_use]
pub fn entity_safety_map(
    filtered: &[&Sample],
    context: &BTreeMap<Ident, ContextData>,
) -> BTreeMap<String, u64> {
    entity_frequency_map(filtered, context, |sample| sample.risk_level == RiskLevel::Low)
}

fn entity_frequency_map(
    filtered: &[&Sample],
    context: &BTreeMap<Ident, ContextData>,
    keep: impl Fn(&Sample) -> bool,
) -> BTreeMap<String, u64> {
    let mut frequencies = BTreeMap::new();
    for sample in filtered.iter().filter(|sample| keep(sample)) {
        let Some(ctx) = resolve(context, &sample.id) else {
            continue;
        };
        for (kind, id) in ctx.all_entities() {
            let key = EntityRef { kind, id: id.clone() }.to_string();
            *frequencies.entry(key).or_insert(0) += 1;
        }
    }
    frequencies
}

/// Policy constants for the case-quality heuristic. These are configuration,
/// not derived values; the defaults reproduce the production weighting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CaseWeights {
    /// Candidates must score strictly above this threshold.
    pub min_score: f64,
    /// Base weight applied to the sample's own score.
    pub per_score: f64,
    /// Weight per explanation link across all chains.
    pub per_link: f64,
    /// Bonus when any link mentions a contaminant-type node.
    pub contaminant_bonus: f64,
    /// Bonus when any link mentions a farmer-type node.
    pub farmer_bonus: f64,
    /// Bonus when any link mentions a market-type node.
    pub market_bonus: f64,
    /// Bonus per long-named first farmer/market entity (a presentation
    /// signal: looks like a real name rather than a bare numeric id).
    pub named_entity_bonus: f64,
    /// A first entity name must exceed this many characters to earn the
    /// named-entity bonus.
    pub named_entity_min_chars: usize,
    /// How many cases to surface.
    pub limit: usize,
}

impl Default for CaseWeights {
    fn default() -> Self {
        Self {
            min_score: 0.8,
            per_score: 10.0,
            per_link: 2.0,
            contaminant_bonus: 20.0,
            farmer_bonus: 15.0,
            market_bonus: 5.0,
            named_entity_bonus: 5.0,
            named_entity_min_chars: 4,
            limit: 5,
        }
    }
}

struct ScoredCase<'a> {
    sample: &'a Sample,
    quality: f64,
}

/// Select the samples that best demonstrate the system's explanatory
/// capability, using [`CaseWeights::default`].
///
/// This is a heuristic ranking, not an optimization with a provable
/// objective: richer, more specific causal chains score higher.
#[must_use]
pub fn find_best_cases<'a>(
    samples: &'a [Sample],
    explanations: &BTreeMap<Ident, Vec<ExplanationChain>>,
    context: &BTreeMap<Ident, ContextData>,
) -> Vec<&'a Sample> {
    find_best_cases_with(samples, explanations, context, &CaseWeights::default())
}

/// [`find_best_cases`] with explicit policy constants.
#[must_use]
pub fn find_best_cases_with<'a>(
    samples: &'a [Sample],
    explanations: &BTreeMap<Ident, Vec<ExplanationChain>>,
    context: &BTreeMap<Ident, ContextData>,
    weights: &CaseWeights,
) -> Vec<&'a Sample> {
    let mut scored: Vec<ScoredCase<'a>> = samples
        .iter()
        .filter(|sample| sample.score > weights.min_score)
        .map(|sample| ScoredCase {
            quality: case_quality(sample, explanations, context, weights),
            sample,
        })
        .collect();

    // Stable sort: ties keep original candidate order.
    scored.sort_by(|a, b| b.quality.partial_cmp(&a.quality).unwrap_or(Ordering::Equal));
    scored.truncate(weights.limit);
    scored.into_iter().map(|case| case.sample).collect()
}

fn case_quality(
    sample: &Sample,
    explanations: &BTreeMap<Ident, Vec<ExplanationChain>>,
    context: &BTreeMap<Ident, ContextData>,
    weights: &CaseWeights,
) -> f64 {
    let mut quality = weights.per_score * sample.score;

    if let Some(chains) = resolve(explanations, &sample.id) {
        let link_count = chains.iter().map(Vec::len).sum::<usize>();
        let link_count = u32::try_from(link_count).unwrap_or(u32::MAX);
        quality += weights.per_link * f64::from(link_count);

        if link_count > 0 {
            let mentions = |kind| chains.iter().flatten().any(|link| link.mentions(kind));
            if mentions(EntityKind::Contaminant) {
                quality += weights.contaminant_bonus;
            }
            if mentions(EntityKind::Farmer) {
                quality += weights.farmer_bonus;
            }
            if mentions(EntityKind::Market) {
                quality += weights.market_bonus;
            }
        }
    }

    if let Some(ctx) = resolve(context, &sample.id) {
        for first in [ctx.farmers.first(), ctx.markets.first()].into_iter().flatten() {
            if first.as_text().chars().count() > weights.named_entity_min_chars {
                quality += weights.named_entity_bonus;
            }
        }
    }

    quality
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn mk_sample(id: i64, score: f64, risk_level: RiskLevel) -> Sample {
        Sample {
            id: Ident::Num(id),
            x: 0.0,
            y: 0.0,
            score,
            label: if risk_level == RiskLevel::Low { Label::Qualified } else { Label::Unqualified },
            risk_level,
            name: format!("sample-{id}"),
            production_province: None,
            production_city: None,
            sale_province: None,
            sale_city: None,
        }
    }

    fn mk_link(from: &str, to: &str, relation: &str) -> ExplanationLink {
        ExplanationLink {
            from: from.to_string(),
            to: to.to_string(),
            relation: relation.to_string(),
            weight: 0.9,
            from_label: None,
            to_label: None,
        }
    }

    fn fixture_samples() -> Vec<Sample> {
        vec![
            mk_sample(1, 0.9, RiskLevel::High),
            mk_sample(2, 0.95, RiskLevel::High),
            mk_sample(3, 0.1, RiskLevel::Low),
        ]
    }

    fn ids(samples: &[&Sample]) -> Vec<Ident> {
        samples.iter().map(|sample| sample.id.clone()).collect()
    }

    // Test IDs: TRES-001
    #[test]
    fn resolve_bridges_numeric_id_to_text_key() {
        let mut map = BTreeMap::new();
        map.insert(Ident::Text("42".to_string()), "context");

        assert_eq!(resolve(&map, &Ident::Num(42)), Some(&"context"));
    }

    // Test IDs: TRES-002
    #[test]
    fn resolve_bridges_text_id_to_numeric_key() {
        let mut map = BTreeMap::new();
        map.insert(Ident::Num(42), "context");

        assert_eq!(resolve(&map, &Ident::Text("42".to_string())), Some(&"context"));
    }

    // Test IDs: TRES-003
    #[test]
    fn resolve_prefers_exact_key_and_reports_absence() {
        let mut map = BTreeMap::new();
        map.insert(Ident::Num(7), "numeric");
        map.insert(Ident::Text("7".to_string()), "text");

        assert_eq!(resolve(&map, &Ident::Num(7)), Some(&"numeric"));
        assert_eq!(resolve(&map, &Ident::Text("7".to_string())), Some(&"text"));
        assert_eq!(resolve(&map, &Ident::Num(8)), None);
    }

    // Test IDs: TFLT-001
    #[test]
    fn default_state_passes_every_sample() {
        let samples = fixture_samples();
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &FilterState::default());

        assert_eq!(ids(&filtered), vec![Ident::Num(1), Ident::Num(2), Ident::Num(3)]);
    }

    // Test IDs: TFLT-002
    #[test]
    fn safe_view_mode_is_a_hard_filter() {
        let samples = fixture_samples();
        let state = FilterState { view_mode: ViewMode::Safe, ..FilterState::default() };
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);

        assert_eq!(ids(&filtered), vec![Ident::Num(3)]);
    }

    // Test IDs: TFLT-003
    #[test]
    fn risk_view_mode_excludes_low_risk() {
        let samples = fixture_samples();
        let state = FilterState { view_mode: ViewMode::Risk, ..FilterState::default() };
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);

        assert_eq!(ids(&filtered), vec![Ident::Num(1), Ident::Num(2)]);
    }

    // Test IDs: TFLT-004
    #[test]
    fn risk_level_allowlist_restricts_only_when_non_empty() {
        let samples = fixture_samples();

        let mut state = FilterState::default();
        state.options.risk_levels.insert(RiskLevel::Low);
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);
        assert_eq!(ids(&filtered), vec![Ident::Num(3)]);

        state.options.risk_levels.clear();
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);
        assert_eq!(filtered.len(), samples.len());
    }

    // Test IDs: TFLT-005
    #[test]
    fn score_threshold_is_inclusive_on_both_bounds() {
        let samples = fixture_samples();

        let mut state = FilterState::default();
        state.options.score_threshold = (0.9, 0.9);
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);
        assert_eq!(ids(&filtered), vec![Ident::Num(1)]);

        state.options.score_threshold = (0.0, 1.0);
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);
        assert_eq!(filtered.len(), samples.len());
    }

    // Test IDs: TFLT-006
    #[test]
    fn search_matches_stringified_id_or_name_substring() {
        let mut samples = fixture_samples();
        samples[2].name = "Zhoushan batch".to_string();

        let state = FilterState { search_query: "Zhoushan".to_string(), ..FilterState::default() };
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);
        assert_eq!(ids(&filtered), vec![Ident::Num(3)]);

        // Substring of the stringified id, case-sensitive, no tokenization.
        let state = FilterState { search_query: "2".to_string(), ..FilterState::default() };
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);
        assert_eq!(ids(&filtered), vec![Ident::Num(2)]);

        let state = FilterState { search_query: "zhoushan".to_string(), ..FilterState::default() };
        assert!(filtered_samples(&samples, &BTreeMap::new(), &state).is_empty());
    }

    // Test IDs: TFLT-007
    #[test]
    fn province_filter_matches_production_province_exactly() {
        let mut samples = fixture_samples();
        samples[0].production_province = Some("Zhejiang".to_string());
        samples[1].production_province = Some("Fujian".to_string());

        let state =
            FilterState { province: Some("Zhejiang".to_string()), ..FilterState::default() };
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);

        assert_eq!(ids(&filtered), vec![Ident::Num(1)]);
    }

    // Test IDs: TFLT-008
    #[test]
    fn pivot_filter_requires_entity_in_resolved_context() {
        let samples = fixture_samples();
        let mut context = BTreeMap::new();
        context.insert(
            Ident::Text("1".to_string()),
            ContextData { farmers: vec![Ident::Num(7), Ident::Num(8)], ..ContextData::default() },
        );
        context.insert(
            Ident::Text("2".to_string()),
            ContextData { farmers: vec![Ident::Num(9)], ..ContextData::default() },
        );

        let state = FilterState { pivot: EntityRef::parse("Farmer[7]"), ..FilterState::default() };
        let filtered = filtered_samples(&samples, &context, &state);

        // Sample 3 has no context at all, so it cannot satisfy the pivot.
        assert_eq!(ids(&filtered), vec![Ident::Num(1)]);
    }

    // Test IDs: TFLT-009
    #[test]
    fn pivot_matches_across_id_representations() {
        let samples = vec![mk_sample(1, 0.5, RiskLevel::Medium)];
        let mut context = BTreeMap::new();
        context.insert(
            Ident::Num(1),
            ContextData {
                farmers: vec![Ident::Text("7".to_string())],
                ..ContextData::default()
            },
        );

        let state = FilterState { pivot: EntityRef::parse("Farmer[7]"), ..FilterState::default() };
        assert_eq!(filtered_samples(&samples, &context, &state).len(), 1);
    }

    // Test IDs: TPVT-001
    #[test]
    fn malformed_pivot_tokens_parse_to_none() {
        for token in ["Farmer", "Farmer[", "Farmer[]", "[7]", "Spaceship[7]", "Farmer 7"] {
            assert_eq!(EntityRef::parse(token), None, "token {token} should not parse");
        }
    }

    // Test IDs: TPVT-002
    #[test]
    fn pivot_tokens_round_trip_through_display() {
        let farmer = EntityRef { kind: EntityKind::Farmer, id: Ident::Num(7001) };
        assert_eq!(farmer.to_string(), "Farmer[7001]");
        assert_eq!(EntityRef::parse("Farmer[7001]"), Some(farmer));

        let named = EntityRef::parse("Market[west-gate]");
        assert_eq!(
            named,
            Some(EntityRef {
                kind: EntityKind::Market,
                id: Ident::Text("west-gate".to_string())
            })
        );
    }

    // Test IDs: TRNK-001
    #[test]
    fn anomalies_rank_descending_and_exclude_low_risk() {
        let samples = fixture_samples();
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &FilterState::default());
        let ranked = top_ranked_anomalies(&filtered);

        assert_eq!(ids(&ranked), vec![Ident::Num(2), Ident::Num(1)]);
        assert!(ranked.iter().all(|sample| sample.risk_level != RiskLevel::Low));
    }

    // Test IDs: TRNK-002
    #[test]
    fn safe_samples_rank_ascending_and_keep_only_low_risk() {
        let samples = fixture_samples();
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &FilterState::default());
        let ranked = top_ranked_safe_samples(&filtered);

        assert_eq!(ids(&ranked), vec![Ident::Num(3)]);
    }

    // Test IDs: TRNK-003
    #[test]
    fn leaderboards_are_capped_at_twenty() {
        let samples: Vec<Sample> = (0..50u32)
            .map(|i| mk_sample(i64::from(i), 0.5 + f64::from(i) / 1000.0, RiskLevel::High))
            .collect();
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &FilterState::default());

        assert_eq!(top_ranked_anomalies(&filtered).len(), TOP_RANKED_LIMIT);
        assert!(top_ranked_safe_samples(&filtered).is_empty());
    }

    // Test IDs: TRNK-004
    #[test]
    fn ranking_ties_keep_original_order() {
        let samples = vec![
            mk_sample(10, 0.9, RiskLevel::High),
            mk_sample(11, 0.9, RiskLevel::High),
            mk_sample(12, 0.9, RiskLevel::High),
        ];
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &FilterState::default());

        assert_eq!(
            ids(&top_ranked_anomalies(&filtered)),
            vec![Ident::Num(10), Ident::Num(11), Ident::Num(12)]
        );
    }

    // Test IDs: TMODE-001
    #[test]
    fn selected_low_risk_sample_forces_safe_mode() {
        let samples = fixture_samples();

        for view_mode in [ViewMode::All, ViewMode::Risk, ViewMode::Safe] {
            assert_eq!(
                analysis_mode(&samples, Some(&Ident::Num(3)), view_mode),
                ViewMode::Safe
            );
        }
    }

    // Test IDs: TMODE-002
    #[test]
    fn selected_risky_sample_forces_risk_mode() {
        let samples = fixture_samples();
        assert_eq!(analysis_mode(&samples, Some(&Ident::Num(1)), ViewMode::Safe), ViewMode::Risk);
    }

    // Test IDs: TMODE-003
    #[test]
    fn view_mode_is_authoritative_without_selection() {
        let samples = fixture_samples();
        for view_mode in [ViewMode::All, ViewMode::Risk, ViewMode::Safe] {
            assert_eq!(analysis_mode(&samples, None, view_mode), view_mode);
        }
    }

    // Test IDs: TMODE-004
    #[test]
    fn selection_by_text_id_still_resolves_the_sample() {
        let samples = fixture_samples();
        assert_eq!(
            analysis_mode(&samples, Some(&Ident::Text("3".to_string())), ViewMode::Risk),
            ViewMode::Safe
        );
    }

    // Test IDs: TMODE-005
    #[test]
    fn display_list_follows_the_resolved_mode() {
        let samples = fixture_samples();
        let filtered = filtered_samples(&samples, &BTreeMap::new(), &FilterState::default());

        assert_eq!(ids(&current_display_list(&filtered, ViewMode::Safe)), vec![Ident::Num(3)]);
        assert_eq!(
            ids(&current_display_list(&filtered, ViewMode::All)),
            vec![Ident::Num(2), Ident::Num(1)]
        );
        assert_eq!(
            ids(&current_display_list(&filtered, ViewMode::Risk)),
            vec![Ident::Num(2), Ident::Num(1)]
        );
    }

    // Test IDs: TAGG-001
    #[test]
    fn entity_risk_map_counts_entities_of_risky_samples_only() {
        let samples = fixture_samples();
        let mut context = BTreeMap::new();
        context.insert(
            Ident::Text("1".to_string()),
            ContextData {
                farmers: vec![Ident::Num(7001)],
                markets: vec![Ident::Num(6001)],
                ..ContextData::default()
            },
        );
        context.insert(
            Ident::Text("2".to_string()),
            ContextData { farmers: vec![Ident::Num(7001)], ..ContextData::default() },
        );
        context.insert(
            Ident::Text("3".to_string()),
            ContextData { farmers: vec![Ident::Num(7002)], ..ContextData::default() },
        );

        let filtered = filtered_samples(&samples, &context, &FilterState::default());
        let risk_map = entity_risk_map(&filtered, &context);

        assert_eq!(risk_map.get("Farmer[7001]"), Some(&2));
        assert_eq!(risk_map.get("Market[6001]"), Some(&1));
        assert_eq!(risk_map.get("Farmer[7002]"), None);

        let safety_map = entity_safety_map(&filtered, &context);
        assert_eq!(safety_map.get("Farmer[7002]"), Some(&1));
        assert_eq!(safety_map.get("Farmer[7001]"), None);
    }

    // Test IDs: TAGG-002
    #[test]
    fn entity_maps_respect_the_filtered_subset() {
        let samples = fixture_samples();
        let mut context = BTreeMap::new();
        context.insert(
            Ident::Text("1".to_string()),
            ContextData { farmers: vec![Ident::Num(7001)], ..ContextData::default() },
        );
        context.insert(
            Ident::Text("2".to_string()),
            ContextData { farmers: vec![Ident::Num(7001)], ..ContextData::default() },
        );

        let mut state = FilterState::default();
        state.options.score_threshold = (0.92, 1.0); // keeps only sample 2
        let filtered = filtered_samples(&samples, &context, &state);
        let risk_map = entity_risk_map(&filtered, &context);

        assert_eq!(risk_map.get("Farmer[7001]"), Some(&1));
    }

    // Test IDs: TCASE-001
    #[test]
    fn best_cases_require_score_above_threshold() {
        let samples = vec![
            mk_sample(1, 0.8, RiskLevel::High), // exactly at threshold: excluded
            mk_sample(2, 0.81, RiskLevel::High),
        ];

        let best = find_best_cases(&samples, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(ids(&best), vec![Ident::Num(2)]);
    }

    // Test IDs: TCASE-002
    #[test]
    fn richer_chains_outrank_higher_bare_scores() {
        let samples = vec![
            mk_sample(1, 0.99, RiskLevel::High),
            mk_sample(2, 0.85, RiskLevel::High),
        ];
        let mut explanations = BTreeMap::new();
        explanations.insert(
            Ident::Text("2".to_string()),
            vec![vec![
                mk_link("Farmer[7001]", "Contaminant[8001]", "misuse"),
                mk_link("Contaminant[8001]", "InspectionRecord[2]", "detected"),
            ]],
        );

        // Sample 1: 9.9. Sample 2: 8.5 + 2*2 + 20 (contaminant) + 15 (farmer).
        let best = find_best_cases(&samples, &explanations, &BTreeMap::new());
        assert_eq!(ids(&best), vec![Ident::Num(2), Ident::Num(1)]);
    }

    // Test IDs: TCASE-003
    #[test]
    fn named_entity_bonus_applies_per_long_first_entity() {
        let samples = vec![
            mk_sample(1, 0.9, RiskLevel::High),
            mk_sample(2, 0.9, RiskLevel::High),
        ];
        let mut context = BTreeMap::new();
        context.insert(
            Ident::Text("1".to_string()),
            ContextData {
                farmers: vec![Ident::Text("Donghai Aquaculture Co".to_string())],
                markets: vec![Ident::Text("West Gate Market".to_string())],
                ..ContextData::default()
            },
        );
        context.insert(
            Ident::Text("2".to_string()),
            ContextData { farmers: vec![Ident::Num(7)], ..ContextData::default() },
        );

        let best = find_best_cases(&samples, &BTreeMap::new(), &context);
        assert_eq!(ids(&best), vec![Ident::Num(1), Ident::Num(2)]);
    }

    // Test IDs: TCASE-004
    #[test]
    fn best_cases_are_capped_at_the_configured_limit() {
        let samples: Vec<Sample> =
            (0..10).map(|i| mk_sample(i, 0.9, RiskLevel::High)).collect();

        let best = find_best_cases(&samples, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(best.len(), CaseWeights::default().limit);
    }

    // Test IDs: TCASE-005
    #[test]
    fn label_fallback_detects_kinds_when_node_tokens_do_not_parse() {
        let mut link = mk_link("node-17", "node-23", "detected");
        link.to_label = Some("Contaminant: malachite green".to_string());

        assert!(link.mentions(EntityKind::Contaminant));
        assert!(!link.mentions(EntityKind::Farmer));

        // Structural parse wins over labels when a token is present.
        let structured = mk_link("Farmer[7001]", "Product[5001]", "supplies");
        assert!(structured.mentions(EntityKind::Farmer));
        assert!(!structured.mentions(EntityKind::Contaminant));
    }

    // Test IDs: TVAL-001
    #[test]
    fn validate_rejects_empty_text_id_and_non_finite_score() {
        let mut sample = mk_sample(1, 0.5, RiskLevel::Low);
        assert_eq!(sample.validate(), Ok(()));

        sample.id = Ident::Text("  ".to_string());
        assert!(matches!(sample.validate(), Err(ExplorerError::Validation(_))));

        let mut sample = mk_sample(1, f64::NAN, RiskLevel::Low);
        assert!(matches!(sample.validate(), Err(ExplorerError::Validation(_))));
        sample.score = 0.5;
        assert_eq!(sample.validate(), Ok(()));
    }

    // Test IDs: TSER-001
    #[test]
    fn sample_deserializes_legacy_vocabulary_and_mixed_id_typing() {
        let raw = r#"{
            "id": 17,
            "x": 1.0,
            "y": 2.0,
            "score": 0.91,
            "label": "不合格",
            "riskLevel": "高风险",
            "production_province": "浙江省"
        }"#;
        let sample: Sample = match serde_json::from_str(raw) {
            Ok(sample) => sample,
            Err(err) => panic!("legacy sample should deserialize: {err}"),
        };

        assert_eq!(sample.id, Ident::Num(17));
        assert_eq!(sample.risk_level, RiskLevel::High);
        assert_eq!(sample.label, Label::Unqualified);
        assert!(sample.name.is_empty());

        let text_id: Sample = match serde_json::from_str(&raw.replace("17", "\"S-17\"")) {
            Ok(sample) => sample,
            Err(err) => panic!("text-id sample should deserialize: {err}"),
        };
        assert_eq!(text_id.id, Ident::Text("S-17".to_string()));
    }

    prop_compose! {
        fn arb_sample()(
            id in 0i64..500,
            textual in any::<bool>(),
            score in 0.0f64..=1.0,
            risk in prop_oneof![
                Just(RiskLevel::High),
                Just(RiskLevel::Medium),
                Just(RiskLevel::Low),
            ],
        ) -> Sample {
            let mut sample = mk_sample(id, score, risk);
            if textual {
                sample.id = Ident::Text(id.to_string());
            }
            sample
        }
    }

    prop_compose! {
        fn arb_state()(
            view_mode in prop_oneof![Just(ViewMode::All), Just(ViewMode::Risk), Just(ViewMode::Safe)],
            levels in proptest::collection::btree_set(
                prop_oneof![
                    Just(RiskLevel::High),
                    Just(RiskLevel::Medium),
                    Just(RiskLevel::Low),
                ],
                0..=3,
            ),
            lo in 0.0f64..=1.0,
            hi in 0.0f64..=1.0,
            query in "[0-9]{0,2}",
        ) -> FilterState {
            let (min, max) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            FilterState {
                view_mode,
                options: FilterOptions { risk_levels: levels, score_threshold: (min, max) },
                search_query: query,
                ..FilterState::default()
            }
        }
    }

    // Test IDs: TPROP-001
    proptest! {
        #[test]
        fn property_filtered_is_a_subset_in_original_order(
            samples in proptest::collection::vec(arb_sample(), 0..40),
            state in arb_state(),
        ) {
            let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);
            prop_assert!(filtered.len() <= samples.len());

            // Every survivor exists in the raw collection, in order.
            let mut cursor = 0usize;
            for kept in &filtered {
                let position = samples[cursor..]
                    .iter()
                    .position(|sample| std::ptr::eq(sample, *kept));
                prop_assert!(position.is_some());
                cursor += position.unwrap_or(0) + 1;
            }
        }
    }

    // Test IDs: TPROP-002
    proptest! {
        #[test]
        fn property_empty_allowlist_equals_full_allowlist(
            samples in proptest::collection::vec(arb_sample(), 0..40),
        ) {
            let empty = FilterState::default();
            let mut full = FilterState::default();
            full.options.risk_levels =
                [RiskLevel::High, RiskLevel::Medium, RiskLevel::Low].into_iter().collect();

            let a = ids(&filtered_samples(&samples, &BTreeMap::new(), &empty));
            let b = ids(&filtered_samples(&samples, &BTreeMap::new(), &full));
            prop_assert_eq!(a, b);
        }
    }

    // Test IDs: TPROP-003
    proptest! {
        #[test]
        fn property_full_score_range_never_excludes(
            samples in proptest::collection::vec(arb_sample(), 0..40),
        ) {
            let state = FilterState::default();
            prop_assert_eq!(
                filtered_samples(&samples, &BTreeMap::new(), &state).len(),
                samples.len()
            );
        }
    }

    // Test IDs: TPROP-004
    proptest! {
        #[test]
        fn property_leaderboard_polarity_and_length(
            samples in proptest::collection::vec(arb_sample(), 0..60),
            state in arb_state(),
        ) {
            let filtered = filtered_samples(&samples, &BTreeMap::new(), &state);
            let anomalies = top_ranked_anomalies(&filtered);
            let safe = top_ranked_safe_samples(&filtered);

            prop_assert!(anomalies.len() <= TOP_RANKED_LIMIT);
            prop_assert!(safe.len() <= TOP_RANKED_LIMIT);
            prop_assert!(anomalies.iter().all(|s| s.risk_level != RiskLevel::Low));
            prop_assert!(safe.iter().all(|s| s.risk_level == RiskLevel::Low));
            prop_assert!(anomalies.windows(2).all(|pair| pair[0].score >= pair[1].score));
            prop_assert!(safe.windows(2).all(|pair| pair[0].score <= pair[1].score));
        }
    }

    // Test IDs: TPROP-005
    proptest! {
        #[test]
        fn property_resolve_is_indifferent_to_key_typing(id in 0i64..10_000) {
            let mut by_num = BTreeMap::new();
            by_num.insert(Ident::Num(id), "value");
            let mut by_text = BTreeMap::new();
            by_text.insert(Ident::Text(id.to_string()), "value");

            for probe in [Ident::Num(id), Ident::Text(id.to_string())] {
                prop_assert_eq!(resolve(&by_num, &probe), Some(&"value"));
                prop_assert_eq!(resolve(&by_text, &probe), Some(&"value"));
            }
        }
    }
}
