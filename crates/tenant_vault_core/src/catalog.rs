//! Entity catalog: the ordered declaration of every entity in a tenant's data set.
//!
//! Order is dependency order: a parent precedes every entity that joins through
//! it. The catalog is validated once at startup and then passed explicitly into
//! the snapshot builder and restore executor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Catalog for the business platform (clients, invoicing, payroll, time, fiscal).
pub const BUSINESS_CATALOG_YAML: &str = include_str!("../catalog/business.yaml");

fn default_primary_key() -> String {
    "id".to_string()
}

/// How rows of an entity are tied to a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeStrategy {
    /// Rows carry the tenant id in `column`.
    Direct { column: String },
    /// Rows belong to the tenant through `foreign_key` pointing at `parent`'s primary key.
    JoinThroughParent { parent: String, foreign_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub scope: ScopeStrategy,
}

impl EntitySpec {
    pub fn direct(name: &str, column: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: default_primary_key(),
            scope: ScopeStrategy::Direct {
                column: column.to_string(),
            },
        }
    }

    pub fn join_through(name: &str, parent: &str, foreign_key: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: default_primary_key(),
            scope: ScopeStrategy::JoinThroughParent {
                parent: parent.to_string(),
                foreign_key: foreign_key.to_string(),
            },
        }
    }

    pub fn with_primary_key(mut self, primary_key: &str) -> Self {
        self.primary_key = primary_key.to_string();
        self
    }

    pub fn parent(&self) -> Option<&str> {
        match &self.scope {
            ScopeStrategy::Direct { .. } => None,
            ScopeStrategy::JoinThroughParent { parent, .. } => Some(parent),
        }
    }

    fn identifiers(&self) -> Vec<&str> {
        let mut ids = vec![self.name.as_str(), self.primary_key.as_str()];
        match &self.scope {
            ScopeStrategy::Direct { column } => ids.push(column),
            ScopeStrategy::JoinThroughParent {
                parent,
                foreign_key,
            } => {
                ids.push(parent);
                ids.push(foreign_key);
            }
        }
        ids
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    entities: Vec<EntitySpec>,
}

/// A validated, topologically ordered list of entity specs. Immutable once built.
#[derive(Debug, Clone)]
pub struct Catalog {
    entities: Vec<EntitySpec>,
    positions: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(entities: Vec<EntitySpec>) -> Result<Self, CatalogError> {
        if entities.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut positions = HashMap::with_capacity(entities.len());
        for (idx, spec) in entities.iter().enumerate() {
            for ident in spec.identifiers() {
                if !is_identifier(ident) {
                    return Err(CatalogError::InvalidIdentifier(ident.to_string()));
                }
            }
            if positions.insert(spec.name.clone(), idx).is_some() {
                return Err(CatalogError::DuplicateEntity(spec.name.clone()));
            }
        }

        for (idx, spec) in entities.iter().enumerate() {
            let Some(parent) = spec.parent() else {
                continue;
            };
            if parent == spec.name {
                return Err(CatalogError::SelfParent(spec.name.clone()));
            }
            match positions.get(parent) {
                None => {
                    return Err(CatalogError::UnknownParent {
                        entity: spec.name.clone(),
                        parent: parent.to_string(),
                    })
                }
                Some(&parent_idx) if parent_idx > idx => {
                    return Err(CatalogError::ParentDeclaredLater {
                        entity: spec.name.clone(),
                        parent: parent.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            entities,
            positions,
        })
    }

    pub fn from_yaml(source: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_yaml::from_str(source).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(file.entities)
    }

    pub fn business() -> Result<Self, CatalogError> {
        Self::from_yaml(BUSINESS_CATALOG_YAML)
    }

    /// Never zero: `new` refuses an empty entity list.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn get(&self, name: &str) -> Option<&EntitySpec> {
        self.positions.get(name).map(|&idx| &self.entities[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Entities in dependency order (parents first).
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &EntitySpec> {
        self.entities.iter()
    }

    /// Entities in reverse dependency order (children first).
    pub fn iter_rev(&self) -> impl Iterator<Item = &EntitySpec> {
        self.entities.iter().rev()
    }

    /// Parent chain of `name`, nearest first.
    pub fn ancestors(&self, name: &str) -> Vec<&EntitySpec> {
        let mut out = Vec::new();
        let mut current = self.get(name).and_then(EntitySpec::parent);
        while let Some(parent_name) = current {
            let Some(parent) = self.get(parent_name) else {
                break;
            };
            out.push(parent);
            current = parent.parent();
        }
        out
    }

    /// Entities that name `name` directly as their parent.
    pub fn children(&self, name: &str) -> impl Iterator<Item = &EntitySpec> + '_ {
        let name = name.to_string();
        self.entities
            .iter()
            .filter(move |spec| spec.parent() == Some(name.as_str()))
    }
}

/// Identifiers are quoted into statements by adapters, so only a conservative
/// lowercase alphabet is accepted.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_lowercase() => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c == '_' || c.is_ascii_lowercase() || c.is_ascii_digit())
}
