//! Trace configuration handed to the event producer.
use crate::error;

/// What the producer should do once its buffers are full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordMode {
    #[default]
    RecordUntilFull,
    RecordContinuously,
    RecordAsMuchAsPossible,
    TraceToConsole,
}

/// Which categories the producer should instrument.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub record_mode: RecordMode,
    pub included_categories: Vec<String>,
    pub excluded_categories: Vec<String>,
}

impl TraceConfig {
    pub fn from_yaml_str(yaml: &str) -> error::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml_string(&self) -> error::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn add_included_category(&mut self, category: impl Into<String>) {
        let category = category.into();
        if !self.included_categories.contains(&category) {
            self.included_categories.push(category);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.included_categories.is_empty()
    }

    /// Whether any category of a comma separated group is included and not
    /// excluded.
    pub fn is_category_group_enabled(&self, category_group: &str) -> bool {
        category_group
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .any(|c| {
                self.included_categories.iter().any(|i| i == c)
                    && !self.excluded_categories.iter().any(|e| e == c)
            })
    }
}
