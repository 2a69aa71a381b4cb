//! 🗺️ EntityRegistry: who is indexable, how we recognise them, and which rule set they get.
//!
//! Built once from config at startup and handed to whoever needs it. No global lookups,
//! no building type names out of strings and hoping something answers.
//! Unknown segments get the generic rule set. Everybody gets a rule set. 🦆

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::errors::{IndexerError, IndexerResult};

/// 📋 One `[[entities]]` entry in the config file.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EntityConfig {
    /// 🏷️ Logical type name, e.g. `Person`. Sent as `type=` to the enumeration endpoint.
    pub name: String,
    /// 🔄 Rule set to apply. Defaults to the lower-cased name.
    #[serde(default)]
    pub rule_set: Option<String>,
    /// 🔍 Id path segment that identifies this type. Defaults to the lower-cased name.
    #[serde(default)]
    pub path_segment: Option<String>,
}

/// 🎫 A rule-set handle. Cheap to clone, compared by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleSet(Arc<str>);

impl RuleSet {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 📦 A resolved, read-only entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub name: String,
    pub path_segment: String,
    pub rule_set: RuleSet,
}

#[derive(Debug, Clone)]
pub struct EntityRegistry {
    descriptors: Vec<EntityDescriptor>,
    by_segment: HashMap<String, usize>,
    generic: RuleSet,
}

impl EntityRegistry {
    pub fn new(entities: &[EntityConfig], generic_rule_set: &str) -> IndexerResult<Self> {
        if generic_rule_set.trim().is_empty() {
            return Err(IndexerError::config("generic rule set name must not be empty"));
        }

        let mut descriptors = Vec::with_capacity(entities.len());
        let mut by_segment = HashMap::new();
        for entity in entities {
            let name = entity.name.trim();
            if name.is_empty() {
                return Err(IndexerError::config("entity with an empty name"));
            }
            let lowered = name.to_lowercase();
            let path_segment = entity
                .path_segment
                .as_deref()
                .map(str::to_lowercase)
                .unwrap_or_else(|| lowered.clone());
            let rule_set = RuleSet::new(entity.rule_set.as_deref().unwrap_or(&lowered));

            // -- 🔒 two entities claiming one segment would make rule selection a coin toss
            let mut keys = vec![path_segment.clone()];
            if lowered != path_segment {
                keys.push(lowered);
            }
            for key in &keys {
                if let Some(&existing) = by_segment.get(key) {
                    let clash: &EntityDescriptor = &descriptors[existing];
                    let reason = if clash.name == name {
                        format!("entity '{name}' is listed twice")
                    } else {
                        format!("entities '{}' and '{name}' both answer to '{key}'", clash.name)
                    };
                    return Err(IndexerError::config(reason));
                }
            }

            let index = descriptors.len();
            descriptors.push(EntityDescriptor {
                name: name.to_string(),
                path_segment,
                rule_set,
            });
            for key in keys {
                by_segment.insert(key, index);
            }
        }

        Ok(Self {
            descriptors,
            by_segment,
            generic: RuleSet::new(generic_rule_set.trim()),
        })
    }

    pub fn entities(&self) -> &[EntityDescriptor] {
        &self.descriptors
    }

    /// 🔍 Case-insensitive match on path segment or type name.
    pub fn lookup(&self, segment: &str) -> Option<&EntityDescriptor> {
        self.by_segment
            .get(&segment.to_lowercase())
            .map(|&idx| &self.descriptors[idx])
    }

    /// 🎯 Rule set for a segment, the generic one when absent or unrecognised.
    pub fn rule_set_for(&self, segment: Option<&str>) -> RuleSet {
        segment
            .and_then(|s| self.lookup(s))
            .map(|descriptor| descriptor.rule_set.clone())
            .unwrap_or_else(|| self.generic.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, rule_set: Option<&str>, segment: Option<&str>) -> EntityConfig {
        EntityConfig {
            name: name.into(),
            rule_set: rule_set.map(Into::into),
            path_segment: segment.map(Into::into),
        }
    }

    #[test]
    fn the_one_where_defaults_are_just_the_name_in_lowercase() -> IndexerResult<()> {
        let registry = EntityRegistry::new(&[entity("Person", None, None)], "generic")?;
        let person = &registry.entities()[0];
        assert_eq!(person.path_segment, "person");
        assert_eq!(person.rule_set.name(), "person");
        assert_eq!(registry.rule_set_for(Some("PERSON")).name(), "person");
        Ok(())
    }

    #[test]
    fn the_one_where_strangers_get_the_generic_rule_set() -> IndexerResult<()> {
        let registry = EntityRegistry::new(
            &[entity("Archief", Some("archive_rules"), Some("archieven"))],
            "generic",
        )?;
        assert_eq!(registry.rule_set_for(Some("archieven")).name(), "archive_rules");
        assert_eq!(registry.rule_set_for(Some("archief")).name(), "archive_rules");
        assert_eq!(registry.rule_set_for(Some("spaceship")).name(), "generic");
        assert_eq!(registry.rule_set_for(None).name(), "generic");
        Ok(())
    }

    #[test]
    fn the_one_where_two_entities_fight_over_one_segment() {
        let err = EntityRegistry::new(
            &[
                entity("Person", None, Some("agents")),
                entity("Organisation", None, Some("agents")),
            ],
            "generic",
        )
        .expect_err("segment clash must be rejected");
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn the_one_where_a_whole_cast_of_defaults_moves_in() -> IndexerResult<()> {
        let registry = EntityRegistry::new(
            &[
                entity("Person", None, None),
                entity("Place", None, None),
                entity("Organisation", None, None),
            ],
            "generic",
        )?;
        assert_eq!(registry.entities().len(), 3);
        assert_eq!(registry.lookup("place").map(|d| d.name.as_str()), Some("Place"));
        assert_eq!(
            registry.lookup("ORGANISATION").map(|d| d.name.as_str()),
            Some("Organisation")
        );
        assert_eq!(registry.rule_set_for(Some("person")).name(), "person");
        Ok(())
    }

    #[test]
    fn the_one_where_the_same_entity_shows_up_twice() {
        let err = EntityRegistry::new(
            &[entity("Person", None, None), entity("Person", Some("other"), None)],
            "generic",
        )
        .expect_err("duplicate entity must be rejected");
        assert!(err.to_string().contains("listed twice"), "{err}");
    }
}
