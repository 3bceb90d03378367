use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of the module-topology exchange: the modules reachable through a
/// connection and the groups they belong to.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleExchange {
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

impl ModuleExchange {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.groups.is_empty()
    }

    /// Groups that `module` is listed under.
    pub fn groups_of<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.groups
            .iter()
            .filter(move |(_, members)| members.iter().any(|m| m == module))
            .map(|(group, _)| group.as_str())
    }
}
