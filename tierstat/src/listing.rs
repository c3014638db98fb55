//! Metric discovery.
//!
//! Keys are enumerated with paginated prefix scans over the owner's sort keys
//! (`namespace#metric#dimensions`) and grouped into a [`MetricList`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::dimensions::{self, Dimensions};
use crate::error::Result;
use crate::record::KEY_SEPARATOR;
use crate::store::MetricStore;

/// Records fetched per page while listing.
pub const LIST_PAGE_SIZE: usize = 100;

/// A distinct metric stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    /// Metric namespace.
    pub namespace: String,
    /// Metric name.
    pub metric: String,
    /// Canonical dimension string.
    pub dimensions: String,
}

/// Grouped listing output. Every list is deduplicated and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricList {
    /// Every namespace seen.
    pub namespaces: Vec<String>,
    /// Metrics in the requested namespace.
    pub metrics: Vec<String>,
    /// Dimension sets of the requested namespace and metric.
    pub dimensions: Vec<Dimensions>,
}

/// Scan prefix for an optional namespace prefix and metric prefix.
///
/// A metric prefix only narrows the scan when it follows a complete namespace.
pub fn scan_prefix(namespace: Option<&str>, metric: Option<&str>) -> String {
    match (namespace, metric) {
        (Some(namespace), Some(metric)) => format!("{namespace}{KEY_SEPARATOR}{metric}"),
        (Some(namespace), None) => namespace.to_string(),
        (None, _) => String::new(),
    }
}

/// Lists distinct keys of `owner` matching the prefixes, following cursors
/// until the scan is exhausted.
///
/// # Errors
///
/// Returns any store error.
pub async fn list_keys(
    store: &dyn MetricStore,
    owner: &str,
    namespace: Option<&str>,
    metric: Option<&str>,
) -> Result<Vec<MetricKey>> {
    let prefix = scan_prefix(namespace, metric);
    let mut keys = BTreeSet::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = store
            .query(owner, &prefix, LIST_PAGE_SIZE, cursor.as_deref())
            .await?;

        keys.extend(page.items.into_iter().map(|record| MetricKey {
            namespace: record.namespace,
            metric: record.metric,
            dimensions: record.dimensions,
        }));

        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(keys.into_iter().collect())
}

/// Groups keys into namespaces, metrics under `namespace`, and dimension
/// sets under `namespace` + `metric`.
pub fn group(keys: &[MetricKey], namespace: Option<&str>, metric: Option<&str>) -> MetricList {
    let mut namespaces = BTreeSet::new();
    let mut metrics = BTreeSet::new();
    let mut dimension_sets = BTreeSet::new();

    for key in keys {
        namespaces.insert(key.namespace.as_str());

        if namespace != Some(key.namespace.as_str()) {
            continue;
        }
        metrics.insert(key.metric.as_str());

        if metric == Some(key.metric.as_str()) {
            dimension_sets.insert(key.dimensions.as_str());
        }
    }

    MetricList {
        namespaces: namespaces.into_iter().map(str::to_string).collect(),
        metrics: metrics.into_iter().map(str::to_string).collect(),
        dimensions: dimension_sets.into_iter().map(dimensions::decode).collect(),
    }
}
