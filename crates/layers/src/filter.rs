use std::collections::{BTreeMap, BTreeSet};

use foundation::{FeatureKey, LatLng, LayerId};
use profile::ProfileProvider;
use scene::{Feature, FeatureQuery, FeatureStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::extract;

/// Which data kinds the user keeps enabled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataTypes {
    pub poi: bool,
    pub routes: bool,
}

impl Default for DataTypes {
    fn default() -> Self {
        Self {
            poi: true,
            routes: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Proximity {
    pub active: bool,
    pub center: Option<LatLng>,
    /// Meters.
    pub radius: f64,
}

/// Transient filter selection owned by the UI. The engine only reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterState {
    pub categories_tree: BTreeSet<String>,
    pub sub_categories_tree: BTreeSet<String>,
    /// `Some(false)` disables the tag clause even with tags selected.
    pub has_tags: Option<bool>,
    pub selected_tags: BTreeSet<String>,
    pub has_min_rating: bool,
    pub min_rating: f64,
    pub search_text: String,
    pub data_types: DataTypes,
    pub proximity: Proximity,
}

impl FilterState {
    /// Parses and validates a UI-provided JSON object.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let state: Self =
            serde_json::from_value(value).map_err(|err| ValidationError::Shape(err.to_string()))?;
        state.validate()?;
        Ok(state)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.has_min_rating && !(self.min_rating.is_finite() && self.min_rating >= 0.0) {
            return Err(ValidationError::MinRating(self.min_rating));
        }
        if self.proximity.active {
            let center = self.proximity.center.ok_or(ValidationError::MissingCenter)?;
            if !center.is_valid() {
                return Err(ValidationError::Center(center));
            }
            let radius = self.proximity.radius;
            if !(radius.is_finite() && radius > 0.0) {
                return Err(ValidationError::Radius(radius));
            }
        }
        Ok(())
    }

    pub fn has_search_text(&self) -> bool {
        !self.search_text.trim().is_empty()
    }

    fn tags_active(&self) -> bool {
        self.has_tags != Some(false) && !self.selected_tags.is_empty()
    }

    fn taxonomy_active(&self) -> bool {
        !self.categories_tree.is_empty() || !self.sub_categories_tree.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed filter state: {0}")]
    Shape(String),
    #[error("minimum rating must be a non-negative number, got {0}")]
    MinRating(f64),
    #[error("proximity filter is active but has no center")]
    MissingCenter,
    #[error("proximity center out of range: {}, {}", .0.lat, .0.lng)]
    Center(LatLng),
    #[error("proximity radius must be a positive number of meters, got {0}")]
    Radius(f64),
}

/// Filter clauses in evaluation order. Evaluation stops at the first failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Clause {
    DataType,
    SearchText,
    Proximity,
    Category,
    MinRating,
    Tags,
}

pub const CLAUSE_ORDER: [Clause; 6] = [
    Clause::DataType,
    Clause::SearchText,
    Clause::Proximity,
    Clause::Category,
    Clause::MinRating,
    Clause::Tags,
];

/// `{filtered, total, visible}` counts for one filter run.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub filtered: usize,
    pub total: usize,
    pub visible: usize,
}

impl FilterSummary {
    pub fn new(total: usize, filtered: usize) -> Self {
        Self {
            filtered,
            total,
            visible: total - filtered.min(total),
        }
    }
}

/// Pass/fail per feature. Rejected features remember the clause that
/// excluded them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterResult {
    outcomes: BTreeMap<FeatureKey, bool>,
    rejected_by: BTreeMap<FeatureKey, Clause>,
}

impl FilterResult {
    pub fn from_outcomes(outcomes: BTreeMap<FeatureKey, bool>) -> Self {
        Self {
            outcomes,
            rejected_by: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &FeatureKey) -> Option<bool> {
        self.outcomes.get(key).copied()
    }

    pub fn passed(&self, key: &FeatureKey) -> bool {
        self.get(key).unwrap_or(false)
    }

    pub fn rejected_by(&self, key: &FeatureKey) -> Option<Clause> {
        self.rejected_by.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FeatureKey, bool)> {
        self.outcomes.iter().map(|(key, passed)| (key, *passed))
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn summary(&self) -> FilterSummary {
        let filtered = self.outcomes.values().filter(|passed| !**passed).count();
        FilterSummary::new(self.outcomes.len(), filtered)
    }

    fn record(&mut self, key: FeatureKey, verdict: Result<(), Clause>) {
        if let Err(clause) = verdict {
            self.rejected_by.insert(key.clone(), clause);
        }
        self.outcomes.insert(key, verdict.is_ok());
    }
}

/// Lower-cased inputs shared by every feature of one evaluation.
struct Prepared<'s> {
    state: &'s FilterState,
    needle: Option<String>,
}

/// Pure predicate evaluation over features. Never mutates features and never
/// fails on feature data: an unresolvable field fails its clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterEngine {
    search_fields: Vec<String>,
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new(
            profile::DEFAULT_SEARCH_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        )
    }
}

impl FilterEngine {
    pub fn new(search_fields: Vec<String>) -> Self {
        Self { search_fields }
    }

    pub fn from_profile(profile: &impl ProfileProvider) -> Self {
        let (source, fields) = profile::resolve_search_fields(profile);
        debug!(?source, ?fields, "search fields resolved");
        Self::new(fields)
    }

    pub fn search_fields(&self) -> &[String] {
        &self.search_fields
    }

    /// Evaluates `features`. Features of layers for which `is_exempt` holds
    /// always pass.
    pub fn evaluate<'a>(
        &self,
        features: impl IntoIterator<Item = &'a Feature>,
        state: &FilterState,
        is_exempt: impl Fn(&LayerId) -> bool,
    ) -> Result<FilterResult, ValidationError> {
        state.validate()?;
        let prepared = Prepared {
            state,
            needle: state
                .has_search_text()
                .then(|| state.search_text.trim().to_lowercase()),
        };

        let mut result = FilterResult::default();
        for feature in features {
            let verdict = if is_exempt(feature.layer_id()) {
                Ok(())
            } else {
                self.check(feature, &prepared)
            };
            result.record(feature.key(), verdict);
        }
        Ok(result)
    }

    /// Evaluates the store's features selected by `query`, honouring each
    /// layer's exemption flag.
    pub fn evaluate_store(
        &self,
        store: &FeatureStore,
        query: &FeatureQuery,
        state: &FilterState,
    ) -> Result<FilterResult, ValidationError> {
        self.evaluate(store.all_features(query), state, |layer| {
            store
                .layer(layer)
                .is_some_and(|record| record.config().is_filter_exempt())
        })
    }

    /// Runs the clauses in order; `Err` names the first failing one.
    fn check(&self, feature: &Feature, prepared: &Prepared<'_>) -> Result<(), Clause> {
        for clause in CLAUSE_ORDER {
            if !self.clause_passes(clause, feature, prepared) {
                return Err(clause);
            }
        }
        Ok(())
    }

    fn clause_passes(&self, clause: Clause, feature: &Feature, prepared: &Prepared<'_>) -> bool {
        let state = prepared.state;
        match clause {
            Clause::DataType => {
                if extract::is_route(feature) {
                    state.data_types.routes
                } else {
                    state.data_types.poi
                }
            }
            Clause::SearchText => match &prepared.needle {
                None => true,
                Some(needle) => self.search_fields.iter().any(|field| {
                    extract::field_text(feature, field)
                        .is_some_and(|text| text.to_lowercase().contains(needle.as_str()))
                }),
            },
            Clause::Proximity => {
                if !state.proximity.active {
                    return true;
                }
                let Some(center) = state.proximity.center else {
                    return false;
                };
                match extract::resolve_coordinates(feature) {
                    Some((_, position)) => position.distance_m(&center) <= state.proximity.radius,
                    None => {
                        debug!(feature = %feature.key(), "no coordinates, proximity clause fails");
                        false
                    }
                }
            }
            Clause::Category => {
                if !state.taxonomy_active() {
                    return true;
                }
                if extract::subcategory(feature)
                    .is_some_and(|sub| state.sub_categories_tree.contains(&sub))
                {
                    return true;
                }
                // A category-only match counts only while no subcategory is
                // selected at all, in any category.
                state.sub_categories_tree.is_empty()
                    && extract::category(feature)
                        .is_some_and(|cat| state.categories_tree.contains(&cat))
            }
            Clause::MinRating => {
                if !state.has_min_rating {
                    return true;
                }
                match extract::resolve_rating(feature) {
                    Some((_, rating)) => rating >= state.min_rating,
                    None => {
                        debug!(feature = %feature.key(), "no rating, min-rating clause fails");
                        false
                    }
                }
            }
            Clause::Tags => {
                if !state.tags_active() {
                    return true;
                }
                extract::tags(feature)
                    .iter()
                    .any(|tag| state.selected_tags.contains(tag))
            }
        }
    }
}
