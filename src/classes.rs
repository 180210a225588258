use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::command::{Button, CommandSet, Facing};

/// Sprite/state configuration shared with the state recognizer.
/// Only the `states` mapping (`estados` in older files) is read here; other
/// sections are ignored.
#[derive(Debug, Deserialize)]
pub struct SpriteConfig {
    #[serde(alias = "estados")]
    pub states: serde_yaml::Mapping,
}

#[derive(Debug, Default, Deserialize)]
struct StateSpec {
    #[serde(default, alias = "comando")]
    command: Option<Vec<String>>,
}

impl SpriteConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sprite config: {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("Failed to parse sprite config: {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Class index → (class name, command) table.
///
/// Each configured state contributes two classes, `<state>-l` and `<state>-r`,
/// whose commands face left and right respectively.
#[derive(Debug, Clone)]
pub struct ClassTable {
    entries: Vec<(String, CommandSet)>,
}

impl ClassTable {
    pub fn from_config(config: &SpriteConfig) -> Result<Self> {
        let mut entries = Vec::with_capacity(config.states.len() * 2);
        for (key, value) in &config.states {
            let name = key
                .as_str()
                .with_context(|| format!("state name must be a string, got {key:?}"))?;
            let entry: Option<StateSpec> = serde_yaml::from_value(value.clone())
                .with_context(|| format!("invalid entry for state {name}"))?;
            let command = match entry.and_then(|s| s.command) {
                Some(buttons) => buttons
                    .iter()
                    .map(|b| b.parse::<Button>())
                    .collect::<Result<CommandSet, _>>()
                    .with_context(|| format!("invalid command for state {name}"))?,
                None => CommandSet::empty(),
            };
            entries.push((format!("{name}-l"), command.facing(Facing::Left)));
            entries.push((format!("{name}-r"), command.facing(Facing::Right)));
        }
        if entries.is_empty() {
            anyhow::bail!("sprite config defines no states");
        }
        Ok(Self { entries })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_config(&SpriteConfig::load(path)?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self, class: usize) -> Option<&str> {
        self.entries.get(class).map(|(n, _)| n.as_str())
    }

    pub fn command(&self, class: usize) -> Option<CommandSet> {
        self.entries.get(class).map(|(_, c)| *c)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }
}
