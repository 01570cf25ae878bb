use crate::config::{FarmConfig, StoreConfig, WILDCARD_TABLE};
use crate::farm::{Farm, FarmSettings};
use sqlfarm_core::{Result, SqlFarmError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// What a caller asks a cursor for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// The wildcard farm.
    Default,
    Table(&'a str),
    /// Every table must live on the same farm.
    Tables(&'a [&'a str]),
    Farm(&'a str),
}

impl Target<'_> {
    /// True when the caller gave no table to route by.
    pub fn is_unspecified(&self) -> bool {
        match self {
            Target::Default => true,
            Target::Table(table) => *table == WILDCARD_TABLE,
            Target::Tables(tables) => tables.is_empty(),
            Target::Farm(_) => false,
        }
    }
}

/// Farm registry and table map, replaced as a whole on reload.
#[derive(Debug, Default)]
pub(crate) struct Topology {
    pub farms: BTreeMap<String, Arc<Farm>>,
    pub tables: HashMap<String, Arc<Farm>>,
}

impl Topology {
    /// Builds the topology for `config`. Farms of `previous` whose settings
    /// are unchanged are carried over as the same object.
    pub fn build(
        config: &StoreConfig,
        previous: &Topology,
        mut settings_for: impl FnMut(&FarmConfig) -> Result<FarmSettings>,
        mut create: impl FnMut(&str, FarmSettings) -> Arc<Farm>,
    ) -> Result<Self> {
        let mut farms = BTreeMap::new();
        let mut tables = HashMap::new();
        for (name, farm_config) in &config.farms {
            let settings = settings_for(farm_config)?;
            let farm = match previous.farms.get(name) {
                Some(existing) if *existing.settings() == settings => existing.clone(),
                _ => create(name, settings),
            };
            for table in &farm_config.tables {
                if let Some(other) = tables.insert(table.clone(), farm.clone()) {
                    warn!(
                        table = %table,
                        replaced = other.name(),
                        farm = %name,
                        "table declared by more than one farm"
                    );
                }
            }
            farms.insert(name.clone(), farm);
        }
        if !farms.is_empty() && !tables.contains_key(WILDCARD_TABLE) {
            return Err(SqlFarmError::Config("No default farm specified".to_string()));
        }
        Ok(Self { farms, tables })
    }

    pub fn wildcard(&self) -> Result<Arc<Farm>> {
        self.tables
            .get(WILDCARD_TABLE)
            .cloned()
            .ok_or_else(|| SqlFarmError::Routing("no default farm configured".to_string()))
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Table map first, then the alias map, then the wildcard farm.
    pub fn farm_for_table(
        &self,
        table: &str,
        aliases: &HashMap<String, String>,
    ) -> Result<Arc<Farm>> {
        if let Some(farm) = self.tables.get(table) {
            return Ok(farm.clone());
        }
        if let Some(farm_name) = aliases.get(table) {
            match self.farms.get(farm_name) {
                Some(farm) => return Ok(farm.clone()),
                None => warn!(
                    table,
                    farm = %farm_name,
                    "farm is not configured, using default farm"
                ),
            }
        }
        self.wildcard()
    }

    pub fn resolve(&self, target: Target<'_>, aliases: &HashMap<String, String>) -> Result<Arc<Farm>> {
        match target {
            Target::Farm(name) => self
                .farms
                .get(name)
                .cloned()
                .ok_or_else(|| SqlFarmError::Routing(format!("farm {name:?} is not configured"))),
            Target::Tables(tables) if !tables.is_empty() => {
                let farms = tables
                    .iter()
                    .map(|table| self.farm_for_table(table, aliases))
                    .collect::<Result<Vec<_>>>()?;
                match farms.split_first() {
                    Some((first, rest)) if rest.iter().all(|farm| Arc::ptr_eq(first, farm)) => {
                        Ok(first.clone())
                    }
                    Some(_) => Err(SqlFarmError::Routing(format!(
                        "{tables:?} are not in the same farm"
                    ))),
                    None => self.wildcard(),
                }
            }
            Target::Table(table) => self.farm_for_table(table, aliases),
            Target::Tables(_) | Target::Default => self.wildcard(),
        }
    }
}
