use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use risk_explorer_core::{
    analysis_mode, current_display_list, entity_risk_map, entity_safety_map, filtered_samples,
    find_best_cases, resolve, top_ranked_anomalies, top_ranked_safe_samples, ContextData,
    EntityRef, ExplanationChain, FilterState, Ident, RiskLevel, Sample, ViewMode,
};

pub const STORE_CONTRACT_VERSION: &str = "store.v1";

pub const SAMPLES_FILE: &str = "api_data_samples.json";
pub const CONTEXT_FILE: &str = "api_data_context.json";
pub const EXPLANATIONS_FILE: &str = "api_data_explanations.json";

const EMPTY_CHAINS: &[ExplanationChain] = &[];

/// The immutable raw dataset: scored samples plus the per-sample context and
/// explanation maps, each parsed from its own JSON document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub samples: Vec<Sample>,
    pub context: BTreeMap<Ident, ContextData>,
    pub explanations: BTreeMap<Ident, Vec<ExplanationChain>>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct DatasetCounts {
    pub samples: usize,
    pub context: usize,
    pub explanations: usize,
}

impl Dataset {
    /// Assemble a dataset from up to three raw JSON documents.
    ///
    /// Each document is parsed independently; a missing or malformed part
    /// degrades to an empty collection with a warning. Sample records that
    /// fail validation are dropped individually.
    #[must_use]
    pub fn from_json_parts(
        samples: Option<&str>,
        context: Option<&str>,
        explanations: Option<&str>,
    ) -> Self {
        Self {
            samples: samples.map_or_else(Vec::new, parse_samples),
            context: context.map_or_else(BTreeMap::new, |raw| parse_keyed(raw, "context")),
            explanations: explanations
                .map_or_else(BTreeMap::new, |raw| parse_keyed(raw, "explanations")),
        }
    }

    /// Load the three well-known dataset files from a directory.
    ///
    /// # Errors
    /// Fails only when `dir` is not a directory. Missing or malformed files
    /// degrade to empty collections instead.
    pub fn load_from_dir(dir: &Path) -> anyhow::Result<Self> {
        anyhow::ensure!(dir.is_dir(), "dataset directory {} does not exist", dir.display());

        let read = |file: &str| -> Option<String> {
            let path = dir.join(file);
            match std::fs::read_to_string(&path) {
                Ok(body) => Some(body),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read dataset file");
                    None
                }
            }
        };

        Ok(Self::from_json_parts(
            read(SAMPLES_FILE).as_deref(),
            read(CONTEXT_FILE).as_deref(),
            read(EXPLANATIONS_FILE).as_deref(),
        ))
    }

    /// Fetch the three well-known dataset files from an HTTP base URL.
    ///
    /// The three requests run in parallel and are joined only for
    /// completion; a failed fetch degrades to an empty collection.
    #[must_use]
    pub fn load_from_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let fetch = |file: &str| -> Option<String> {
            let url = format!("{base}/{file}");
            match ureq::get(&url).call() {
                Ok(response) => match response.into_string() {
                    Ok(body) => Some(body),
                    Err(err) => {
                        warn!(%url, error = %err, "failed to read dataset response body");
                        None
                    }
                },
                Err(err) => {
                    warn!(%url, error = %err, "dataset fetch failed");
                    None
                }
            }
        };

        let (samples, context, explanations) = std::thread::scope(|scope| {
            let samples = scope.spawn(|| fetch(SAMPLES_FILE));
            let context = scope.spawn(|| fetch(CONTEXT_FILE));
            let explanations = scope.spawn(|| fetch(EXPLANATIONS_FILE));
            (join_fetch(samples), join_fetch(context), join_fetch(explanations))
        });

        Self::from_json_parts(samples.as_deref(), context.as_deref(), explanations.as_deref())
    }

    #[must_use]
    pub fn counts(&self) -> DatasetCounts {
        DatasetCounts {
            samples: self.samples.len(),
            context: self.context.len(),
            explanations: self.explanations.len(),
        }
    }

    /// Content fingerprint over a canonical serialization, `ds_<16 hex>`.
    /// Stable across loads of the same data regardless of source.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for sample in &self.samples {
            hasher.update(serde_json::to_vec(sample).unwrap_or_default());
            hasher.update(b"\n");
        }
        for (id, ctx) in &self.context {
            hasher.update(id.as_text().as_bytes());
            hasher.update(b"=");
            hasher.update(serde_json::to_vec(ctx).unwrap_or_default());
            hasher.update(b"\n");
        }
        for (id, chains) in &self.explanations {
            hasher.update(id.as_text().as_bytes());
            hasher.update(b"=");
            hasher.update(serde_json::to_vec(chains).unwrap_or_default());
            hasher.update(b"\n");
        }

        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|byte| format!("{byte:02x}")).collect();
        format!("ds_{hex}")
    }
}

fn join_fetch(handle: std::thread::ScopedJoinHandle<'_, Option<String>>) -> Option<String> {
    handle.join().unwrap_or_else(|_| {
        warn!("dataset loader thread panicked");
        None
    })
}

fn parse_samples(raw: &str) -> Vec<Sample> {
    match serde_json::from_str::<Vec<Sample>>(raw) {
        Ok(parsed) => parsed
            .into_iter()
            .filter(|sample| match sample.validate() {
                Ok(()) => true,
                Err(err) => {
                    warn!(id = %sample.id, error = %err, "dropping invalid sample record");
                    false
                }
            })
            .collect(),
        Err(err) => {
            warn!(error = %err, "failed to parse samples document");
            Vec::new()
        }
    }
}

// JSON object keys always arrive as text; the resolver bridges them back to
// numeric sample ids at lookup time.
fn parse_keyed<T: DeserializeOwned>(raw: &str, document: &str) -> BTreeMap<Ident, T> {
    match serde_json::from_str::<BTreeMap<String, T>>(raw) {
        Ok(parsed) => parsed.into_iter().map(|(key, value)| (Ident::Text(key), value)).collect(),
        Err(err) => {
            warn!(document, error = %err, "failed to parse dataset document");
            BTreeMap::new()
        }
    }
}

/// The derived views cached by the store, recomputed synchronously at the
/// end of every mutator.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DerivedViews {
    pub filtered: Vec<Sample>,
    pub anomalies: Vec<Sample>,
    pub safe: Vec<Sample>,
    pub display: Vec<Sample>,
    pub analysis_mode: ViewMode,
    pub entity_risk: BTreeMap<String, u64>,
    pub entity_safety: BTreeMap<String, u64>,
}

/// The explorer state container: a write-once dataset, the interactive
/// filter state, and the cached derived views.
///
/// There is no hidden reactivity; every mutator ends with an explicit
/// recomputation of [`DerivedViews`].
#[derive(Debug, Clone, Default)]
pub struct ExplorerStore {
    dataset: Dataset,
    loaded: bool,
    fingerprint: Option<String>,
    loaded_at: Option<OffsetDateTime>,
    best_cases: Vec<Sample>,
    filter: FilterState,
    derived: DerivedViews,
}

impl ExplorerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the dataset. One-shot: a second call is a no-op and returns
    /// `false`, leaving the original dataset in place.
    pub fn initialize(&mut self, dataset: Dataset) -> bool {
        if self.loaded {
            warn!("store already initialized; ignoring new dataset");
            return false;
        }

        self.fingerprint = Some(dataset.fingerprint());
        self.best_cases = find_best_cases(&dataset.samples, &dataset.explanations, &dataset.context)
            .into_iter()
            .cloned()
            .collect();
        self.dataset = dataset;
        self.loaded = true;
        self.loaded_at = Some(OffsetDateTime::now_utc());
        self.recompute();
        true
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    #[must_use]
    pub fn loaded_at_rfc3339(&self) -> Option<String> {
        self.loaded_at.and_then(|at| at.format(&Rfc3339).ok())
    }

    #[must_use]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    #[must_use]
    pub fn filter(&self) -> &FilterState {
        &self.filter
    }

    #[must_use]
    pub fn views(&self) -> &DerivedViews {
        &self.derived
    }

    /// Best representative cases over the full collection. Depends only on
    /// the dataset, so it is computed once at initialization.
    #[must_use]
    pub fn best_cases(&self) -> &[Sample] {
        &self.best_cases
    }

    #[must_use]
    pub fn selected_sample(&self) -> Option<&Sample> {
        let id = self.filter.selected.as_ref()?;
        risk_explorer_core::find_sample(&self.dataset.samples, id)
    }

    #[must_use]
    pub fn selected_context(&self) -> Option<&ContextData> {
        let id = self.filter.selected.as_ref()?;
        resolve(&self.dataset.context, id)
    }

    /// Explanation chains for the selected sample. `Some(&[])` when a sample
    /// is selected but has no recorded explanation; `None` without a
    /// selection.
    #[must_use]
    pub fn selected_explanation(&self) -> Option<&[ExplanationChain]> {
        let id = self.filter.selected.as_ref()?;
        Some(resolve(&self.dataset.explanations, id).map_or(EMPTY_CHAINS, Vec::as_slice))
    }

    /// Select a sample, or deselect it when it is already selected.
    pub fn toggle_select(&mut self, id: Ident) {
        toggle(&mut self.filter.selected, id);
        self.recompute();
    }

    /// Switch the top-level view mode. Clears the selection and resets the
    /// soft filters; the new mode itself is preserved.
    pub fn set_view_mode(&mut self, mode: ViewMode) {
        self.filter = FilterState { view_mode: mode, ..FilterState::default() };
        self.recompute();
    }

    pub fn set_risk_levels(&mut self, levels: BTreeSet<RiskLevel>) {
        self.filter.options.risk_levels = levels;
        self.recompute();
    }

    /// Set the inclusive score range, normalized to ascending order.
    pub fn set_score_range(&mut self, a: f64, b: f64) {
        self.filter.options.score_threshold = if a <= b { (a, b) } else { (b, a) };
        self.recompute();
    }

    pub fn set_search(&mut self, query: String) {
        self.filter.search_query = query;
        self.recompute();
    }

    /// Engage the province filter, or clear it when the same province is
    /// already active. Clears the selection either way.
    pub fn toggle_province(&mut self, province: String) {
        toggle(&mut self.filter.province, province);
        self.filter.selected = None;
        self.recompute();
    }

    /// Engage the pivot cross-filter from a `Kind[id]` token, or clear it
    /// when the same pivot is already active. A malformed token clears the
    /// pivot silently. Clears the selection either way.
    pub fn toggle_pivot(&mut self, token: &str) {
        match EntityRef::parse(token) {
            Some(pivot) => toggle(&mut self.filter.pivot, pivot),
            None => {
                if !token.is_empty() {
                    warn!(token, "ignoring malformed pivot token");
                }
                self.filter.pivot = None;
            }
        }
        self.filter.selected = None;
        self.recompute();
    }

    pub fn clear_pivot(&mut self) {
        self.filter.pivot = None;
        self.recompute();
    }

    /// Restore default filter options and clear search, province, pivot and
    /// selection. The view mode is preserved.
    pub fn reset_filters(&mut self) {
        self.filter = FilterState { view_mode: self.filter.view_mode, ..FilterState::default() };
        self.recompute();
    }

    /// Replace the whole filter state in one step, then recompute. Used by
    /// batch consumers (CLI flags) that assemble the state up front.
    pub fn apply_filter_state(&mut self, state: FilterState) {
        self.filter = state;
        self.recompute();
    }

    fn recompute(&mut self) {
        let filtered =
            filtered_samples(&self.dataset.samples, &self.dataset.context, &self.filter);
        let mode = analysis_mode(
            &self.dataset.samples,
            self.filter.selected.as_ref(),
            self.filter.view_mode,
        );

        self.derived = DerivedViews {
            anomalies: clone_list(&top_ranked_anomalies(&filtered)),
            safe: clone_list(&top_ranked_safe_samples(&filtered)),
            display: clone_list(&current_display_list(&filtered, mode)),
            analysis_mode: mode,
            entity_risk: entity_risk_map(&filtered, &self.dataset.context),
            entity_safety: entity_safety_map(&filtered, &self.dataset.context),
            filtered: filtered.into_iter().cloned().collect(),
        };
    }
}

fn toggle<T: PartialEq>(slot: &mut Option<T>, value: T) {
    if slot.as_ref() == Some(&value) {
        *slot = None;
    } else {
        *slot = Some(value);
    }
}

fn clone_list(list: &[&Sample]) -> Vec<Sample> {
    list.iter().map(|sample| (*sample).clone()).collect()
}
