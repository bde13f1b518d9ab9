//! Query Executor
//!
//! Runs an extracted statement exactly once and renders the result. No retries;
//! a warehouse failure is terminal for the run.

use crate::error::{AskError, Result};
use crate::execution::table::ResultTable;
use crate::execution::warehouse::Warehouse;
use crate::extract::Extraction;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use tracing::{info, warn};

/// Which statements may reach the warehouse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementPolicy {
    /// Execute whatever the model produced.
    #[default]
    Unrestricted,
    /// Only query statements (SELECT / WITH ... SELECT / set operations).
    ReadOnly,
}

impl StatementPolicy {
    pub fn check(&self, sql: &str) -> Result<()> {
        match self {
            StatementPolicy::Unrestricted => Ok(()),
            StatementPolicy::ReadOnly => {
                let statements = Parser::parse_sql(&BigQueryDialect {}, sql)
                    .map_err(|e| AskError::Policy(format!("could not parse statement: {}", e)))?;

                if statements.is_empty() {
                    return Err(AskError::Policy("no statement to execute".to_string()));
                }
                for statement in &statements {
                    if !matches!(statement, Statement::Query(_)) {
                        let keyword = statement
                            .to_string()
                            .split_whitespace()
                            .next()
                            .unwrap_or_default()
                            .to_uppercase();
                        return Err(AskError::Policy(format!(
                            "read-only policy allows queries only, got {}",
                            keyword
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
pub struct QueryExecutor {
    warehouse: Arc<dyn Warehouse>,
    policy: StatementPolicy,
    max_rows: Option<usize>,
}

impl QueryExecutor {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            policy: StatementPolicy::default(),
            max_rows: None,
        }
    }

    pub fn with_policy(mut self, policy: StatementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cap on rendered rows; `None` renders the whole result set.
    pub fn with_max_rows(mut self, max_rows: Option<usize>) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn warehouse_name(&self) -> &'static str {
        self.warehouse.name()
    }

    /// Execute an extraction. The invalid-question sentinel yields the empty
    /// table marker without touching the warehouse.
    pub async fn execute(&self, extraction: &Extraction) -> Result<ResultTable> {
        match extraction.sql() {
            Some(sql) => self.run_sql(sql).await,
            None => Ok(ResultTable::empty()),
        }
    }

    pub async fn run_sql(&self, sql: &str) -> Result<ResultTable> {
        self.policy.check(sql)?;

        info!("🔍 Executing on {}: {}", self.warehouse.name(), sql);
        let result = self
            .warehouse
            .execute(sql, self.max_rows)
            .await?
            .cap_rows(self.max_rows);

        if result.truncated {
            warn!(
                "Result truncated to {} rows (warehouse reported {:?})",
                result.row_count(),
                result.total_rows
            );
        }
        info!("✅ Query completed in {}ms, {} rows", result.execution_time_ms, result.row_count());

        ResultTable::from_query_result(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::local::LocalWarehouse;

    #[test]
    fn test_unrestricted_allows_anything() {
        assert!(StatementPolicy::Unrestricted.check("DROP TABLE x").is_ok());
        assert!(StatementPolicy::Unrestricted.check("not even sql").is_ok());
    }

    #[test]
    fn test_read_only_allows_queries() {
        let policy = StatementPolicy::ReadOnly;
        assert!(policy
            .check("SELECT foretag, omsattning FROM `dnb_data.dnb_ab_falkenberg` WHERE bokslutsar = '2022' ORDER BY omsattning DESC LIMIT 1")
            .is_ok());
        assert!(policy
            .check("WITH t AS (SELECT foretag FROM dnb_data.dnb_ab_falkenberg) SELECT COUNT(*) FROM t")
            .is_ok());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let policy = StatementPolicy::ReadOnly;
        for sql in [
            "DELETE FROM dnb_data.dnb_ab_falkenberg WHERE 1 = 1",
            "DROP TABLE dnb_data.dnb_ab_falkenberg",
            "SELECT 1; DROP TABLE dnb_data.dnb_ab_falkenberg",
        ] {
            let err = policy.check(sql).unwrap_err();
            assert!(matches!(err, AskError::Policy(_)), "{} was not rejected", sql);
        }
    }

    #[test]
    fn test_read_only_rejects_unparseable() {
        assert!(matches!(
            StatementPolicy::ReadOnly.check("SELEKT foretag"),
            Err(AskError::Policy(_))
        ));
    }

    fn executor() -> QueryExecutor {
        use polars::prelude::*;

        let df = df![
            "foretag" => ["Acme AB", "Beta AB", "Cepa AB"],
            "omsattning" => [120_000i64, 450_000, 80_000],
        ]
        .unwrap();
        let warehouse = LocalWarehouse::new().with_table("dnb_ab_falkenberg", df);
        QueryExecutor::new(Arc::new(warehouse))
    }

    #[tokio::test]
    async fn test_invalid_question_yields_empty_table() {
        let table = executor().execute(&Extraction::InvalidQuestion).await.unwrap();
        assert!(table.is_empty());
        assert_eq!(table.to_markdown(), "");
    }

    #[tokio::test]
    async fn test_execute_renders_result() {
        let extraction = Extraction::Sql(
            "SELECT foretag FROM `dnb_data.dnb_ab_falkenberg` ORDER BY omsattning DESC LIMIT 1".to_string(),
        );
        let table = executor().execute(&extraction).await.unwrap();
        assert_eq!(table.columns, vec!["foretag"]);
        assert_eq!(table.rows, vec![vec!["Beta AB".to_string()]]);
    }

    #[tokio::test]
    async fn test_row_cap_applies() {
        let table = executor()
            .with_max_rows(Some(2))
            .run_sql("SELECT foretag FROM dnb_ab_falkenberg")
            .await
            .unwrap();
        assert_eq!(table.row_count(), 2);
        assert!(table.truncated);
        assert_eq!(table.total_rows, Some(3));
    }

    #[tokio::test]
    async fn test_policy_checked_before_warehouse() {
        let result = executor()
            .with_policy(StatementPolicy::ReadOnly)
            .run_sql("DROP TABLE dnb_ab_falkenberg")
            .await;
        assert!(matches!(result, Err(AskError::Policy(_))));
    }
}
