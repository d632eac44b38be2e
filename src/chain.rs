use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One control in the fixed filter chain. Declaration order is chain order;
/// every field depends on all fields declared before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    State,
    City,
    ZipCode,
    PlaceOfService,
    ProviderType,
    Credential,
    HcpcsCode,
}

impl FilterField {
    pub const ALL: [FilterField; 7] = [
        FilterField::State,
        FilterField::City,
        FilterField::ZipCode,
        FilterField::PlaceOfService,
        FilterField::ProviderType,
        FilterField::Credential,
        FilterField::HcpcsCode,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Every field this one depends on, in chain order.
    pub fn upstream(self) -> &'static [FilterField] {
        &Self::ALL[..self.index()]
    }

    /// Every field that depends on this one, in chain order.
    pub fn downstream(self) -> &'static [FilterField] {
        &Self::ALL[self.index() + 1..]
    }

    pub fn next(self) -> Option<FilterField> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn column(self) -> &'static str {
        match self {
            FilterField::State => "state",
            FilterField::City => "city",
            FilterField::ZipCode => "zip_code",
            FilterField::PlaceOfService => "place_of_service",
            FilterField::ProviderType => "provider_type",
            FilterField::Credential => "credential",
            FilterField::HcpcsCode => "hcpcs_code",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FilterField::State => "State",
            FilterField::City => "City",
            FilterField::ZipCode => "Zip Code",
            FilterField::PlaceOfService => "Place of Service",
            FilterField::ProviderType => "Provider Type",
            FilterField::Credential => "Credential",
            FilterField::HcpcsCode => "HCPCS Code",
        }
    }

    /// Value applied on first load, before the session's gate has ever opened.
    pub fn default_value(self) -> Vec<String> {
        let values: &[&str] = match self {
            FilterField::State => &["TN"],
            FilterField::City => &["Nashville"],
            FilterField::ZipCode => &[],
            FilterField::PlaceOfService => &["Non-Facility"],
            FilterField::ProviderType => &["Family Practice", "General Practice"],
            FilterField::Credential => &[],
            FilterField::HcpcsCode => &["99213", "99214", "99215"],
        };
        values.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// An `IN (...)` constraint on one column. Empty selections never become predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub field: FilterField,
    pub values: Vec<String>,
}

/// Current value of every filter control. A missing or empty entry is a wildcard.
/// Stored value lists are normalized and sorted, so two selections of the same
/// values compare equal whatever order they were picked in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterSelection {
    values: BTreeMap<FilterField, Vec<String>>,
}

impl FilterSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: FilterField, values: Vec<String>) {
        let mut values = normalize_values(values);
        values.sort();
        if values.is_empty() {
            self.values.remove(&field);
        } else {
            self.values.insert(field, values);
        }
    }

    #[cfg(test)]
    pub fn with(mut self, field: FilterField, values: &[&str]) -> Self {
        self.set(field, values.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn get(&self, field: FilterField) -> &[String] {
        self.values.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Non-empty fields in chain order, each value list sorted.
    pub fn normalized(&self) -> Vec<(FilterField, Vec<String>)> {
        self.values
            .iter()
            .map(|(field, values)| (*field, values.clone()))
            .collect()
    }

    /// Predicates for every field upstream of `field`.
    pub fn predicates_for(&self, field: FilterField) -> Vec<Predicate> {
        self.predicates_over(field.upstream())
    }

    /// Predicates for the whole chain.
    pub fn predicates(&self) -> Vec<Predicate> {
        self.predicates_over(&FilterField::ALL)
    }

    fn predicates_over(&self, fields: &[FilterField]) -> Vec<Predicate> {
        fields
            .iter()
            .filter_map(|f| {
                self.values.get(f).map(|values| Predicate {
                    field: *f,
                    values: values.clone(),
                })
            })
            .collect()
    }
}

/// Trims entries, drops blanks and duplicates; keeps first-seen order.
pub fn normalize_values(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for v in values {
        let v = v.trim();
        if v.is_empty() || out.iter().any(|o| o == v) {
            continue;
        }
        out.push(v.to_string());
    }
    out
}
