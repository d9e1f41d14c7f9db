//! Model name resolution.
//!
//! Short logical names (`opus`, `sonnet`, `haiku`, or the tier names
//! `capable`, `balanced`, `fast`) resolve to concrete provider identifiers.
//! The table starts from a static fallback and can be refreshed from the
//! provider's model listing at startup.  Unknown names are passed through
//! verbatim with a warning.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::llm::provider::CompletionProvider;

/// A model family with one current concrete identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModelFamily {
    /// Most capable, slowest.
    Opus,
    /// Balanced cost and capability.
    Sonnet,
    /// Fast and cheap.
    Haiku,
}

impl ModelFamily {
    /// All families, most capable first.
    pub const ALL: [ModelFamily; 3] = [Self::Opus, Self::Sonnet, Self::Haiku];

    /// Parse a family or tier name, case-insensitively.
    pub fn from_alias(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "opus" | "capable" | "claude-opus" => Some(Self::Opus),
            "sonnet" | "balanced" | "claude-sonnet" | "claude" => Some(Self::Sonnet),
            "haiku" | "fast" | "claude-haiku" => Some(Self::Haiku),
            _ => None,
        }
    }

    /// The family keyword as it appears inside concrete model ids.
    fn keyword(self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Sonnet => "sonnet",
            Self::Haiku => "haiku",
        }
    }

    /// Static fallback identifier used when the provider cannot be queried.
    fn fallback_id(self) -> &'static str {
        match self {
            Self::Opus => "claude-opus-4-20250514",
            Self::Sonnet => "claude-sonnet-4-20250514",
            Self::Haiku => "claude-haiku-4-5-20251001",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Alias table plus refresh.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    resolved: BTreeMap<ModelFamily, String>,
    /// Concrete ids reported by the provider at the last refresh.
    listed: Vec<String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_fallbacks()
    }
}

impl ModelRegistry {
    /// A registry populated from the static fallback table only.
    pub fn with_fallbacks() -> Self {
        let resolved = ModelFamily::ALL
            .iter()
            .map(|f| (*f, f.fallback_id().to_owned()))
            .collect();
        Self {
            resolved,
            listed: Vec::new(),
        }
    }

    /// Query the provider and merge the newest listed id of each family over
    /// the current table.  Families the provider does not list keep their
    /// previous value.  Returns how many families were updated.
    ///
    /// On error the table is left untouched.
    pub async fn refresh(&mut self, provider: &dyn CompletionProvider) -> Result<usize> {
        let listed = provider.list_models().await?;
        let updated = self.merge_listed(listed);
        info!(
            provider = provider.name(),
            updated, "model registry refreshed"
        );
        Ok(updated)
    }

    /// Merge a provider listing (newest first) into the table.
    pub fn merge_listed(&mut self, listed: Vec<String>) -> usize {
        let mut updated = 0;
        for family in ModelFamily::ALL {
            let newest = listed
                .iter()
                .find(|id| id.split('-').any(|part| part == family.keyword()));
            if let Some(id) = newest
                && self.resolved.get(&family) != Some(id)
            {
                debug!(%family, model = %id, "model alias updated");
                self.resolved.insert(family, id.clone());
                updated += 1;
            }
        }
        self.listed = listed;
        updated
    }

    /// Resolve a logical or concrete model name.
    ///
    /// Empty input stays empty (meaning the provider default).  Aliases map
    /// through the table; concrete ids pass through silently; anything else
    /// passes through with a warning.
    pub fn resolve(&self, name: &str) -> String {
        let name = name.trim();
        if name.is_empty() {
            return String::new();
        }

        if let Some(family) = ModelFamily::from_alias(name)
            && let Some(id) = self.resolved.get(&family)
        {
            return id.clone();
        }

        if self.is_known(name) {
            return name.to_owned();
        }

        warn!(model = name, "unresolved model name, passing through unchanged");
        name.to_owned()
    }

    /// The concrete id currently mapped to a family.
    pub fn family_id(&self, family: ModelFamily) -> &str {
        self.resolved
            .get(&family)
            .map(String::as_str)
            .unwrap_or_else(|| family.fallback_id())
    }

    fn is_known(&self, name: &str) -> bool {
        name.starts_with("claude-")
            || self.listed.iter().any(|id| id == name)
            || self.resolved.values().any(|id| id == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_and_tiers_resolve_to_fallbacks() {
        let registry = ModelRegistry::with_fallbacks();
        assert_eq!(registry.resolve("opus"), "claude-opus-4-20250514");
        assert_eq!(registry.resolve("Capable"), "claude-opus-4-20250514");
        assert_eq!(registry.resolve("balanced"), "claude-sonnet-4-20250514");
        assert_eq!(registry.resolve("fast"), registry.family_id(ModelFamily::Haiku));
    }

    #[test]
    fn unknown_names_pass_through() {
        let registry = ModelRegistry::with_fallbacks();
        assert_eq!(registry.resolve("my-local-model"), "my-local-model");
        assert_eq!(registry.resolve("claude-3-7-sonnet-latest"), "claude-3-7-sonnet-latest");
        assert_eq!(registry.resolve("  "), "");
    }

    #[test]
    fn merge_takes_first_listed_id_per_family() {
        let mut registry = ModelRegistry::with_fallbacks();
        let updated = registry.merge_listed(vec![
            "claude-opus-4-6".into(),
            "claude-sonnet-4-5-20250929".into(),
            "claude-opus-4-1-20250805".into(),
            "claude-sonnet-4-20250514".into(),
        ]);

        assert_eq!(updated, 2);
        assert_eq!(registry.resolve("opus"), "claude-opus-4-6");
        assert_eq!(registry.resolve("sonnet"), "claude-sonnet-4-5-20250929");
        // Not listed: fallback retained.
        assert_eq!(registry.resolve("haiku"), "claude-haiku-4-5-20251001");
    }
}
