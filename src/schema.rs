//! Schema Description
//!
//! The one table the assistant can answer questions about. This is fixed
//! knowledge embedded in the generation prompt, never introspected from the
//! warehouse.

use crate::error::{AskError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    /// Informal type and unit notes, e.g. "turnover, in kSEK".
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub table_name: String,
    pub dataset_name: String,
    pub columns: Vec<ColumnDescription>,
    /// Reporting period the model must assume when the question names none.
    pub default_period: String,
}

impl SchemaDescription {
    /// Company register for Falkenberg, one row per company and fiscal year.
    pub fn falkenberg_companies() -> Self {
        Self {
            table_name: "dnb_ab_falkenberg".to_string(),
            dataset_name: "dnb_data".to_string(),
            columns: vec![
                column("foretag", "company name"),
                column("omsattning", "turnover, in ksek"),
                column("anstallda", "number of employees"),
                column("bransch_grov", "coarse industry sector"),
                column("bokslutsar", "fiscal year, string, e.g. '2021'"),
            ],
            default_period: "2022".to_string(),
        }
    }

    /// Load a schema description from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AskError::Schema(format!("Failed to read {}: {}", path.display(), e)))?;
        let schema: SchemaDescription = serde_json::from_str(&content)
            .map_err(|e| AskError::Schema(format!("Failed to parse {}: {}", path.display(), e)))?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_name.trim().is_empty() {
            return Err(AskError::Schema("table_name must not be empty".to_string()));
        }
        if self.dataset_name.trim().is_empty() {
            return Err(AskError::Schema("dataset_name must not be empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(AskError::Schema(format!("table {} has no columns", self.table_name)));
        }
        if let Some(col) = self.columns.iter().find(|c| c.name.trim().is_empty()) {
            return Err(AskError::Schema(format!("column with empty name ({})", col.description)));
        }
        Ok(())
    }

    /// `dataset.table`, as written in warehouse SQL.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.dataset_name, self.table_name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

impl Default for SchemaDescription {
    fn default() -> Self {
        Self::falkenberg_companies()
    }
}

fn column(name: &str, description: &str) -> ColumnDescription {
    ColumnDescription {
        name: name.to_string(),
        description: description.to_string(),
    }
}
