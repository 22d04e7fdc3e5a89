use serde::{Deserialize, Serialize};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// One entry of the provider's model list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Model {
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owned_by: None,
            description: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owned_by = Some(owner.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Description if known, else the owner.
    pub fn summary(&self) -> Option<String> {
        self.description
            .clone()
            .or_else(|| self.owned_by.as_ref().map(|owner| format!("owned by {owner}")))
    }
}

/// Trims ids, drops blanks, then sorts and dedups by id.
pub fn normalize_models(models: impl IntoIterator<Item = Model>) -> Vec<Model> {
    let mut models = models
        .into_iter()
        .filter_map(|mut model| {
            model.id = model.id.trim().to_string();
            model.owned_by = model
                .owned_by
                .map(|owner| owner.trim().to_string())
                .filter(|owner| !owner.is_empty());
            (!model.id.is_empty()).then_some(model)
        })
        .collect::<Vec<_>>();
    models.sort_by(|left, right| left.id.cmp(&right.id));
    models.dedup_by(|left, right| left.id == right.id);
    models
}

/// Shown when no credential is set or the provider cannot be reached.
pub fn default_openai_models() -> Vec<Model> {
    vec![
        Model::from_id("gpt-4o-mini").with_description("Balanced cost/performance default"),
        Model::from_id("gpt-4o").with_description("High quality general model"),
        Model::from_id("gpt-4.1").with_description("Reasoning-forward GPT-4.1"),
        Model::from_id("o3").with_description("Advanced reasoning model"),
    ]
}
