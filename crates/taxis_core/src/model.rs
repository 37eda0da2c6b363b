//! Entity/relationship model descriptors.
//!
//! Types, attributes and references are plain values. References point at
//! their opposite by name, so a model never forms object cycles.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{TaxisError, TaxisResult, ValueType};

/// Physical strategy used to store a reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageRule {
    /// The owner's table holds the target id.
    ForeignKey,
    /// The target's table holds the owner id.
    InverseForeignKey,
    JoinTable,
}

/// Stable identity of a reference: declaring type plus reference name.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ReferenceKey {
    pub owner: String,
    pub name: String,
}

impl ReferenceKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.name)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_true")]
    pub mutable: bool,
}

impl AttributeDef {
    pub fn column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTableDef {
    pub table: String,
    pub owner_column: String,
    pub target_column: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDef {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub containment: bool,
    #[serde(default)]
    pub lower: u32,
    /// `None` means unbounded.
    #[serde(default)]
    pub upper: Option<u32>,
    #[serde(default)]
    pub opposite: Option<String>,
    pub storage: StorageRule,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub join_table: Option<JoinTableDef>,
    #[serde(default = "default_true")]
    pub mutable: bool,
}

impl ReferenceDef {
    pub fn is_mandatory(&self) -> bool {
        self.lower >= 1
    }

    pub fn is_many(&self) -> bool {
        self.upper != Some(1)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeDef {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(rename = "abstract", default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    #[serde(default)]
    pub references: Vec<ReferenceDef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDocument {
    #[serde(default)]
    pub version: Option<String>,
    pub types: Vec<EntityTypeDef>,
}

/// Read access to the resolved model, consumed by processors, executors and
/// the join builder.
pub trait MetadataResolver: Send + Sync {
    fn entity_type(&self, name: &str) -> TaxisResult<&EntityTypeDef>;

    fn entity_types(&self) -> Vec<&EntityTypeDef>;

    fn table_name(&self, entity_type: &str) -> TaxisResult<&str> {
        Ok(&self.entity_type(entity_type)?.table)
    }

    /// The type itself first, then its ancestors up to the root.
    fn type_chain(&self, entity_type: &str) -> TaxisResult<Vec<&EntityTypeDef>> {
        let mut chain = Vec::new();
        let mut current = Some(self.entity_type(entity_type)?);
        while let Some(def) = current {
            chain.push(def);
            current = match &def.parent {
                Some(parent) => Some(self.entity_type(parent)?),
                None => None,
            };
        }
        Ok(chain)
    }

    fn is_assignable(&self, sub: &str, sup: &str) -> bool {
        self.type_chain(sub)
            .map(|chain| chain.iter().any(|def| def.name == sup))
            .unwrap_or(false)
    }

    /// Strict subtypes, in declaration order.
    fn subtypes(&self, entity_type: &str) -> Vec<&EntityTypeDef> {
        self.entity_types()
            .into_iter()
            .filter(|def| def.name != entity_type && self.is_assignable(&def.name, entity_type))
            .collect()
    }

    /// Looks up an attribute across the chain and returns its declaring type.
    fn attribute(
        &self,
        entity_type: &str,
        name: &str,
    ) -> TaxisResult<Option<(&EntityTypeDef, &AttributeDef)>> {
        for def in self.type_chain(entity_type)? {
            if let Some(attribute) = def.attributes.iter().find(|attr| attr.name == name) {
                return Ok(Some((def, attribute)));
            }
        }
        Ok(None)
    }

    fn reference(
        &self,
        entity_type: &str,
        name: &str,
    ) -> TaxisResult<Option<(ReferenceKey, &ReferenceDef)>> {
        for def in self.type_chain(entity_type)? {
            if let Some(reference) = def.references.iter().find(|reference| reference.name == name)
            {
                return Ok(Some((ReferenceKey::new(&def.name, &reference.name), reference)));
            }
        }
        Ok(None)
    }

    /// Attributes of the whole chain, root type first, declaration order within a type.
    fn all_attributes(
        &self,
        entity_type: &str,
    ) -> TaxisResult<Vec<(&EntityTypeDef, &AttributeDef)>> {
        let chain = self.type_chain(entity_type)?;
        Ok(chain
            .into_iter()
            .rev()
            .flat_map(|def| def.attributes.iter().map(move |attr| (def, attr)))
            .collect())
    }

    fn all_references(&self, entity_type: &str) -> TaxisResult<Vec<(ReferenceKey, &ReferenceDef)>> {
        let chain = self.type_chain(entity_type)?;
        Ok(chain
            .into_iter()
            .rev()
            .flat_map(|def| {
                def.references
                    .iter()
                    .map(move |reference| (ReferenceKey::new(&def.name, &reference.name), reference))
            })
            .collect())
    }

    fn reference_def(&self, key: &ReferenceKey) -> TaxisResult<&ReferenceDef> {
        self.entity_type(&key.owner)?
            .references
            .iter()
            .find(|reference| reference.name == key.name)
            .ok_or_else(|| TaxisError::not_found(format!("reference {key}")))
    }

    fn storage_rule(&self, key: &ReferenceKey) -> TaxisResult<StorageRule> {
        Ok(self.reference_def(key)?.storage)
    }

    fn is_mandatory(&self, key: &ReferenceKey) -> TaxisResult<bool> {
        Ok(self.reference_def(key)?.is_mandatory())
    }

    /// Foreign key column of a `ForeignKey` or `InverseForeignKey` reference.
    fn reference_column(&self, key: &ReferenceKey) -> TaxisResult<&str> {
        self.reference_def(key)?
            .column
            .as_deref()
            .ok_or_else(|| TaxisError::configuration(format!("reference {key} has no column")))
    }

    fn join_table(&self, key: &ReferenceKey) -> TaxisResult<&JoinTableDef> {
        self.reference_def(key)?
            .join_table
            .as_ref()
            .ok_or_else(|| TaxisError::configuration(format!("reference {key} has no join table")))
    }

    fn opposite(&self, key: &ReferenceKey) -> TaxisResult<Option<ReferenceKey>> {
        let def = self.reference_def(key)?;
        match &def.opposite {
            Some(name) => Ok(self.reference(&def.target, name)?.map(|(key, _)| key)),
            None => Ok(None),
        }
    }

    /// Join-table references whose target is this type or one of its ancestors.
    fn join_table_references_into(&self, entity_type: &str) -> TaxisResult<Vec<ReferenceKey>> {
        let chain: Vec<String> = self
            .type_chain(entity_type)?
            .into_iter()
            .map(|def| def.name.clone())
            .collect();
        let mut keys = Vec::new();
        for def in self.entity_types() {
            for reference in &def.references {
                if reference.storage == StorageRule::JoinTable && chain.contains(&reference.target) {
                    keys.push(ReferenceKey::new(&def.name, &reference.name));
                }
            }
        }
        Ok(keys)
    }
}

/// Validated model registry; declaration order is preserved.
#[derive(Clone, Debug)]
pub struct Model {
    types: Vec<EntityTypeDef>,
    index: HashMap<String, usize>,
    version: Option<String>,
}

impl Model {
    pub fn new(document: ModelDocument) -> TaxisResult<Self> {
        let mut index = HashMap::new();
        for (position, def) in document.types.iter().enumerate() {
            if index.insert(def.name.clone(), position).is_some() {
                return Err(TaxisError::configuration(format!(
                    "duplicate entity type {}",
                    def.name
                )));
            }
        }
        let model = Self {
            types: document.types,
            index,
            version: document.version,
        };
        model.validate()?;
        Ok(model)
    }

    pub fn from_json(raw: &str) -> TaxisResult<Self> {
        let document: ModelDocument = serde_json::from_str(raw)
            .map_err(|err| TaxisError::configuration(format!("model document: {err}")))?;
        Self::new(document)
    }

    pub fn from_value(value: JsonValue) -> TaxisResult<Self> {
        let document: ModelDocument = serde_json::from_value(value)
            .map_err(|err| TaxisError::configuration(format!("model document: {err}")))?;
        Self::new(document)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn validate(&self) -> TaxisResult<()> {
        for def in &self.types {
            self.validate_hierarchy(def)?;
        }
        for def in &self.types {
            let mut names: Vec<&str> = Vec::new();
            for chain_def in self.type_chain(&def.name)? {
                for attr in &chain_def.attributes {
                    names.push(&attr.name);
                }
                for reference in &chain_def.references {
                    names.push(&reference.name);
                }
            }
            let mut sorted = names.clone();
            sorted.sort_unstable();
            if let Some(window) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
                return Err(TaxisError::configuration(format!(
                    "member {} declared twice in the chain of {}",
                    window[0], def.name
                )));
            }
            for reference in &def.references {
                self.validate_reference(def, reference)?;
            }
        }
        Ok(())
    }

    fn validate_hierarchy(&self, def: &EntityTypeDef) -> TaxisResult<()> {
        let mut steps = 0;
        let mut current = def.parent.as_deref();
        while let Some(parent) = current {
            steps += 1;
            if steps > self.types.len() {
                return Err(TaxisError::configuration(format!(
                    "inheritance cycle through {}",
                    def.name
                )));
            }
            current = self.entity_type(parent)?.parent.as_deref();
        }
        Ok(())
    }

    fn validate_reference(&self, owner: &EntityTypeDef, def: &ReferenceDef) -> TaxisResult<()> {
        let key = ReferenceKey::new(&owner.name, &def.name);
        self.entity_type(&def.target)?;
        if let Some(upper) = def.upper {
            if upper == 0 || def.lower > upper {
                return Err(TaxisError::configuration(format!(
                    "reference {key} has invalid bounds {}..{upper}",
                    def.lower
                )));
            }
        }
        match def.storage {
            StorageRule::ForeignKey => {
                if def.column.is_none() || def.upper != Some(1) {
                    return Err(TaxisError::configuration(format!(
                        "foreign key reference {key} needs a column and upper bound 1"
                    )));
                }
            }
            StorageRule::InverseForeignKey => {
                if def.column.is_none() {
                    return Err(TaxisError::configuration(format!(
                        "inverse foreign key reference {key} needs a column"
                    )));
                }
            }
            StorageRule::JoinTable => {
                if def.join_table.is_none() {
                    return Err(TaxisError::configuration(format!(
                        "join table reference {key} needs a join_table"
                    )));
                }
            }
        }
        let Some(opposite_name) = &def.opposite else {
            return Ok(());
        };
        let Some((opposite_key, opposite)) = self.reference(&def.target, opposite_name)? else {
            return Err(TaxisError::configuration(format!(
                "opposite {opposite_name} of {key} not found on {}",
                def.target
            )));
        };
        if let Some(back) = &opposite.opposite {
            if back != &def.name {
                return Err(TaxisError::configuration(format!(
                    "{opposite_key} names {back} as opposite, expected {}",
                    def.name
                )));
            }
        }
        if !self.is_assignable(&owner.name, &opposite.target)
            && !self.is_assignable(&opposite.target, &owner.name)
        {
            return Err(TaxisError::configuration(format!(
                "{opposite_key} does not point back at {}",
                owner.name
            )));
        }
        let consistent = match (def.storage, opposite.storage) {
            (StorageRule::ForeignKey, StorageRule::InverseForeignKey)
            | (StorageRule::InverseForeignKey, StorageRule::ForeignKey) => {
                def.column == opposite.column
            }
            (StorageRule::JoinTable, StorageRule::JoinTable) => {
                match (&def.join_table, &opposite.join_table) {
                    (Some(left), Some(right)) => {
                        left.table == right.table
                            && left.owner_column == right.target_column
                            && left.target_column == right.owner_column
                    }
                    _ => false,
                }
            }
            _ => false,
        };
        if !consistent {
            return Err(TaxisError::configuration(format!(
                "{key} and {opposite_key} disagree on storage"
            )));
        }
        Ok(())
    }
}

impl MetadataResolver for Model {
    fn entity_type(&self, name: &str) -> TaxisResult<&EntityTypeDef> {
        self.index
            .get(name)
            .map(|position| &self.types[*position])
            .ok_or_else(|| TaxisError::not_found(format!("entity type {name}")))
    }

    fn entity_types(&self) -> Vec<&EntityTypeDef> {
        self.types.iter().collect()
    }
}
