//! Header-to-field mapping: inference from header names and per-row
//! application.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Source header name to destination field. `None` (or an empty string) means
/// the column is ignored.
pub type ColumnMapping = BTreeMap<String, Option<String>>;

static SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \-]").expect("valid separator regex"));

/// Lowercases and turns every space or hyphen into one underscore. Runs and
/// edges are kept as-is so `_thumbnail_id` still matches ` thumbnail id`.
pub fn normalize_name(name: &str) -> String {
    SEPARATOR.replace_all(&name.to_lowercase(), "_").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedTarget {
    pub header: String,
    pub field: String,
}

/// A mapping resolved against one concrete header row.
#[derive(Debug, Clone, Default)]
pub struct CompiledMapping {
    targets: Vec<(usize, String)>,
    pub rejected: Vec<RejectedTarget>,
}

impl CompiledMapping {
    /// Builds the destination dict for one row. Cells missing at the end of a
    /// short row become empty strings; later headers overwrite earlier ones
    /// mapped to the same field.
    pub fn apply(&self, row: &[String]) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        for (index, field) in &self.targets {
            let value = row.get(*index).cloned().unwrap_or_default();
            fields.insert(field.clone(), value);
        }
        fields
    }

    pub fn mapped_fields(&self) -> BTreeSet<&str> {
        self.targets.iter().map(|(_, field)| field.as_str()).collect()
    }

    /// Required fields no column maps to.
    pub fn uncovered(&self, required: &[String]) -> Vec<String> {
        let mapped = self.mapped_fields();
        required
            .iter()
            .filter(|field| !mapped.contains(field.as_str()))
            .cloned()
            .collect()
    }
}

pub struct ColumnMapper {
    known_fields: Vec<String>,
}

impl ColumnMapper {
    pub fn new(known_fields: &[String]) -> Self {
        Self {
            known_fields: known_fields
                .iter()
                .map(|field| field.trim().to_string())
                .filter(|field| !field.is_empty())
                .collect(),
        }
    }

    pub fn infer_mapping(&self, headers: &[String]) -> ColumnMapping {
        let normalized_fields = self
            .known_fields
            .iter()
            .map(|field| (normalize_name(field), field))
            .collect::<Vec<_>>();

        headers
            .iter()
            .map(|header| {
                let normalized = normalize_name(header);
                let target = normalized_fields
                    .iter()
                    .find(|(candidate, _)| *candidate == normalized)
                    .map(|(_, field)| (*field).clone());
                (header.clone(), target)
            })
            .collect()
    }

    pub fn compile(&self, mapping: &ColumnMapping, headers: &[String]) -> CompiledMapping {
        let mut compiled = CompiledMapping::default();
        let mut first_header_for = BTreeMap::<String, &str>::new();

        for (index, header) in headers.iter().enumerate() {
            let Some(field) = mapping
                .get(header)
                .and_then(|target| target.as_deref())
                .map(str::trim)
                .filter(|field| !field.is_empty())
            else {
                continue;
            };

            if !self.known_fields.iter().any(|known| known == field) {
                if !compiled.rejected.iter().any(|rejected| rejected.header == *header) {
                    compiled.rejected.push(RejectedTarget {
                        header: header.clone(),
                        field: field.to_string(),
                    });
                }
                continue;
            }

            if let Some(previous) = first_header_for.get(field) {
                warn!(
                    field,
                    previous = *previous,
                    header = %header,
                    "several columns map to one field; the later column wins"
                );
            } else {
                first_header_for.insert(field.to_string(), header.as_str());
            }
            compiled.targets.push((index, field.to_string()));
        }

        if !compiled.rejected.is_empty() {
            warn!(
                rejected = compiled.rejected.len(),
                "mapping targets outside the field whitelist were dropped"
            );
        }
        compiled
    }

    pub fn apply(
        &self,
        mapping: &ColumnMapping,
        row: &[String],
        headers: &[String],
    ) -> BTreeMap<String, String> {
        self.compile(mapping, headers).apply(row)
    }

    /// Required fields no column maps to.
    pub fn uncovered_required(
        &self,
        mapping: &ColumnMapping,
        headers: &[String],
        required: &[String],
    ) -> Vec<String> {
        self.compile(mapping, headers).uncovered(required)
    }
}
