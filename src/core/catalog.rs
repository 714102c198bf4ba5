//! Typed parameter catalog.
//!
//! Holds metadata and latest values for every discovered parameter across
//! the two address spaces. Single-writer (the serial task), many-reader
//! (HTTP handlers): readers always see a consistent value/timestamp pair and
//! entries never disappear after discovery.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::protocol::constants::{Command, PANEL_ADDRESS};
use crate::core::protocol::pdu::StructEntry;
use crate::core::protocol::value::{ParamType, ParamValue};

/// Catalog index offset for the panel space (panel wire index N is stored
/// at N + 10000; regulator indices are stored as-is).
pub const PANEL_INDEX_OFFSET: u32 = 10_000;

/// The two parameter banks on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSpace {
    Regulator,
    Panel,
}

impl AddressSpace {
    /// Where the catalog stores a wire index from this space.
    pub fn catalog_index(self, wire_index: u16) -> u32 {
        match self {
            AddressSpace::Regulator => u32::from(wire_index),
            AddressSpace::Panel => u32::from(wire_index) + PANEL_INDEX_OFFSET,
        }
    }

    /// Recover (space, wire index) from a catalog index.
    pub fn from_catalog_index(index: u32) -> (Self, u16) {
        if index >= PANEL_INDEX_OFFSET {
            (AddressSpace::Panel, (index - PANEL_INDEX_OFFSET) as u16)
        } else {
            (AddressSpace::Regulator, index as u16)
        }
    }

    /// Struct request variant for discovering this space.
    pub fn struct_command(self) -> Command {
        match self {
            AddressSpace::Regulator => Command::GetParamsStructWithRange,
            AddressSpace::Panel => Command::GetParamsStruct,
        }
    }

    /// Bus destination serving this space.
    pub fn destination(self, controller_address: u16) -> u16 {
        match self {
            AddressSpace::Regulator => controller_address,
            AddressSpace::Panel => PANEL_ADDRESS,
        }
    }
}

/// One catalog entry: stable metadata plus the latest observed value.
#[derive(Debug, Clone, Serialize)]
pub struct Parameter {
    pub catalog_index: u32,
    pub wire_index: u16,
    pub address_space: AddressSpace,
    pub name: String,
    pub unit_code: u8,
    pub param_type: ParamType,
    pub writable: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Display exponent from the panel struct variant, passed through
    /// verbatim for clients to interpret.
    pub exponent: Option<i8>,
    pub current_value: Option<ParamValue>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Parameter {
    /// Build a catalog entry from a parsed struct record.
    pub fn from_struct_entry(space: AddressSpace, entry: StructEntry) -> Self {
        Self {
            catalog_index: space.catalog_index(entry.wire_index),
            wire_index: entry.wire_index,
            address_space: space,
            name: entry.name,
            unit_code: entry.unit_code,
            param_type: entry.param_type,
            writable: entry.writable,
            min: entry.min,
            max: entry.max,
            exponent: entry.exponent,
            current_value: None,
            last_update: None,
        }
    }
}

/// How callers address a parameter.
#[derive(Debug, Clone)]
pub enum ParamSelector {
    /// By name; ambiguous names resolve to the lowest catalog index
    /// (regulator space before panel space).
    Name(String),
    /// By catalog index.
    Index(u32),
}

impl ParamSelector {
    /// Parse an HTTP path segment: digits select by index, anything else
    /// by name.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<u32>() {
            Ok(index) => ParamSelector::Index(index),
            Err(_) => ParamSelector::Name(raw.to_string()),
        }
    }
}

impl std::fmt::Display for ParamSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamSelector::Name(name) => write!(f, "{name}"),
            ParamSelector::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// Consistent point-in-time view of the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub timestamp: DateTime<Utc>,
    pub parameters: BTreeMap<u32, Parameter>,
}

#[derive(Default)]
struct CatalogInner {
    params: BTreeMap<u32, Parameter>,
    by_name: HashMap<String, Vec<u32>>,
    last_refresh: Option<DateTime<Utc>>,
}

/// Shared catalog handle. Cloning is cheap; all clones view the same data.
#[derive(Clone, Default)]
pub struct ParamCatalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl ParamCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append discovered parameters. Existing entries are never replaced
    /// (the catalog is append-only after discovery); entries with empty
    /// names are dropped.
    pub async fn insert_batch(&self, params: Vec<Parameter>) -> usize {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let mut added = 0;
        for param in params {
            if param.name.is_empty() {
                continue;
            }
            if inner.params.contains_key(&param.catalog_index) {
                continue;
            }
            let indices = inner.by_name.entry(param.name.clone()).or_default();
            if !indices.contains(&param.catalog_index) {
                indices.push(param.catalog_index);
                indices.sort_unstable();
            }
            inner.params.insert(param.catalog_index, param);
            added += 1;
        }
        added
    }

    /// Apply a batch of polled values atomically: readers see either the
    /// pre-batch or post-batch state of each entry, never a value without
    /// its timestamp.
    pub async fn apply_values(
        &self,
        space: AddressSpace,
        values: &[(u16, ParamValue)],
        stamp: DateTime<Utc>,
    ) -> usize {
        let mut inner = self.inner.write().await;
        let mut updated = 0;
        for (wire_index, value) in values {
            let index = space.catalog_index(*wire_index);
            if let Some(param) = inner.params.get_mut(&index) {
                param.current_value = Some(value.clone());
                param.last_update = Some(stamp);
                updated += 1;
            } else {
                debug!("Polled value for unknown catalog index {index}, ignored");
            }
        }
        if updated > 0 {
            inner.last_refresh = Some(stamp);
        }
        updated
    }

    /// Optimistically record a value we just wrote to the controller.
    pub async fn record_written_value(
        &self,
        catalog_index: u32,
        value: ParamValue,
        stamp: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write().await;
        if let Some(param) = inner.params.get_mut(&catalog_index) {
            param.current_value = Some(value);
            param.last_update = Some(stamp);
        }
    }

    pub async fn get(&self, catalog_index: u32) -> Option<Parameter> {
        self.inner.read().await.params.get(&catalog_index).cloned()
    }

    /// All entries carrying `name`, across both spaces, by catalog index.
    pub async fn find_by_name(&self, name: &str) -> Vec<Parameter> {
        let inner = self.inner.read().await;
        inner
            .by_name
            .get(name)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|i| inner.params.get(i).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve a selector. Ambiguous names resolve to the lowest catalog
    /// index, which puts the regulator space first.
    pub async fn resolve(&self, selector: &ParamSelector) -> Option<Parameter> {
        match selector {
            ParamSelector::Index(index) => self.get(*index).await,
            ParamSelector::Name(name) => self.find_by_name(name).await.into_iter().next(),
        }
    }

    pub async fn snapshot(&self) -> CatalogSnapshot {
        let inner = self.inner.read().await;
        CatalogSnapshot {
            timestamp: inner.last_refresh.unwrap_or_else(Utc::now),
            parameters: inner.params.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.params.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.params.is_empty()
    }

    /// Number of contiguous wire indices known for a space (discovery fills
    /// each space from wire index 0), used to bound polling pages.
    pub async fn wire_count(&self, space: AddressSpace) -> u16 {
        let inner = self.inner.read().await;
        let range = match space {
            AddressSpace::Regulator => 0..PANEL_INDEX_OFFSET,
            AddressSpace::Panel => PANEL_INDEX_OFFSET..u32::MAX,
        };
        inner
            .params
            .range(range)
            .next_back()
            .map(|(index, _)| AddressSpace::from_catalog_index(*index).1 + 1)
            .unwrap_or(0)
    }

    /// Wire-index → type lookup table for one polling page.
    pub async fn types_for_page(
        &self,
        space: AddressSpace,
        first: u16,
        count: u16,
    ) -> HashMap<u16, ParamType> {
        let inner = self.inner.read().await;
        let mut out = HashMap::with_capacity(usize::from(count));
        for wire in first..first.saturating_add(count) {
            if let Some(param) = inner.params.get(&space.catalog_index(wire)) {
                out.insert(wire, param.param_type);
            }
        }
        out
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.last_refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(space: AddressSpace, wire: u16, name: &str, ty: ParamType) -> Parameter {
        Parameter {
            catalog_index: space.catalog_index(wire),
            wire_index: wire,
            address_space: space,
            name: name.to_string(),
            unit_code: 1,
            param_type: ty,
            writable: true,
            min: None,
            max: None,
            exponent: None,
            current_value: None,
            last_update: None,
        }
    }

    #[test]
    fn index_mapping() {
        assert_eq!(AddressSpace::Regulator.catalog_index(103), 103);
        assert_eq!(AddressSpace::Panel.catalog_index(103), 10_103);
        assert_eq!(
            AddressSpace::from_catalog_index(103),
            (AddressSpace::Regulator, 103)
        );
        assert_eq!(
            AddressSpace::from_catalog_index(10_103),
            (AddressSpace::Panel, 103)
        );
    }

    #[test]
    fn space_routing() {
        assert_eq!(
            AddressSpace::Regulator.struct_command(),
            Command::GetParamsStructWithRange
        );
        assert_eq!(AddressSpace::Panel.struct_command(), Command::GetParamsStruct);
        assert_eq!(AddressSpace::Regulator.destination(1), 1);
        assert_eq!(AddressSpace::Panel.destination(1), PANEL_ADDRESS);
    }

    #[tokio::test]
    async fn insert_is_append_only() {
        let catalog = ParamCatalog::new();
        let added = catalog
            .insert_batch(vec![param(AddressSpace::Regulator, 0, "A", ParamType::UInt8)])
            .await;
        assert_eq!(added, 1);

        // Same index again: original metadata wins.
        let mut dup = param(AddressSpace::Regulator, 0, "A_renamed", ParamType::UInt16);
        dup.catalog_index = 0;
        assert_eq!(catalog.insert_batch(vec![dup]).await, 0);
        assert_eq!(catalog.get(0).await.unwrap().name, "A");
    }

    #[tokio::test]
    async fn empty_names_are_dropped() {
        let catalog = ParamCatalog::new();
        let added = catalog
            .insert_batch(vec![param(AddressSpace::Regulator, 5, "", ParamType::UInt8)])
            .await;
        assert_eq!(added, 0);
        assert!(catalog.is_empty().await);
    }

    #[tokio::test]
    async fn name_collisions_across_spaces() {
        let catalog = ParamCatalog::new();
        catalog
            .insert_batch(vec![
                param(AddressSpace::Regulator, 7, "Status", ParamType::UInt16),
                param(AddressSpace::Panel, 7, "Status", ParamType::UInt8),
            ])
            .await;

        let hits = catalog.find_by_name("Status").await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].catalog_index, 7);
        assert_eq!(hits[1].catalog_index, 10_007);

        // Ambiguous name resolves to the regulator entry.
        let resolved = catalog
            .resolve(&ParamSelector::Name("Status".into()))
            .await
            .unwrap();
        assert_eq!(resolved.address_space, AddressSpace::Regulator);

        let by_index = catalog.resolve(&ParamSelector::Index(10_007)).await.unwrap();
        assert_eq!(by_index.address_space, AddressSpace::Panel);
    }

    #[tokio::test]
    async fn apply_values_updates_value_and_stamp_together() {
        let catalog = ParamCatalog::new();
        catalog
            .insert_batch(vec![param(AddressSpace::Regulator, 3, "T", ParamType::Int16)])
            .await;

        let stamp = Utc::now();
        let updated = catalog
            .apply_values(AddressSpace::Regulator, &[(3, ParamValue::Int16(21))], stamp)
            .await;
        assert_eq!(updated, 1);

        let p = catalog.get(3).await.unwrap();
        assert_eq!(p.current_value, Some(ParamValue::Int16(21)));
        assert_eq!(p.last_update, Some(stamp));
        assert_eq!(catalog.last_refresh().await, Some(stamp));
    }

    #[tokio::test]
    async fn unknown_polled_indices_are_ignored() {
        let catalog = ParamCatalog::new();
        catalog
            .insert_batch(vec![param(AddressSpace::Regulator, 3, "T", ParamType::Int16)])
            .await;
        let updated = catalog
            .apply_values(
                AddressSpace::Regulator,
                &[(99, ParamValue::Int16(1))],
                Utc::now(),
            )
            .await;
        assert_eq!(updated, 0);
    }

    #[tokio::test]
    async fn wire_count_per_space() {
        let catalog = ParamCatalog::new();
        assert_eq!(catalog.wire_count(AddressSpace::Regulator).await, 0);

        catalog
            .insert_batch(vec![
                param(AddressSpace::Regulator, 0, "A", ParamType::UInt8),
                param(AddressSpace::Regulator, 41, "B", ParamType::UInt8),
                param(AddressSpace::Panel, 12, "C", ParamType::UInt8),
            ])
            .await;

        assert_eq!(catalog.wire_count(AddressSpace::Regulator).await, 42);
        assert_eq!(catalog.wire_count(AddressSpace::Panel).await, 13);
    }

    #[tokio::test]
    async fn types_for_page_window() {
        let catalog = ParamCatalog::new();
        catalog
            .insert_batch(vec![
                param(AddressSpace::Regulator, 0, "A", ParamType::UInt8),
                param(AddressSpace::Regulator, 1, "B", ParamType::Float),
                param(AddressSpace::Regulator, 5, "C", ParamType::Bool),
            ])
            .await;

        let types = catalog.types_for_page(AddressSpace::Regulator, 0, 4).await;
        assert_eq!(types.len(), 2);
        assert_eq!(types.get(&0), Some(&ParamType::UInt8));
        assert_eq!(types.get(&1), Some(&ParamType::Float));
        assert_eq!(types.get(&5), None);
    }

    #[tokio::test]
    async fn snapshot_is_detached() {
        let catalog = ParamCatalog::new();
        catalog
            .insert_batch(vec![param(AddressSpace::Regulator, 0, "A", ParamType::UInt8)])
            .await;

        let snap = catalog.snapshot().await;
        catalog
            .apply_values(AddressSpace::Regulator, &[(0, ParamValue::UInt8(9))], Utc::now())
            .await;

        // The earlier snapshot still shows the pre-update state.
        assert!(snap.parameters.get(&0).unwrap().current_value.is_none());
    }
}
