//! Prompt Composer - the two system prompts of a run
//!
//! Both prompts are pure string construction. The generation prompt carries the
//! schema verbatim and the invalid-question rule; the analysis prompt carries the
//! question, the SQL that ran and the rendered result table.

use crate::schema::SchemaDescription;

/// Exact reply the model must give when a question can't be answered from the table.
pub const INVALID_QUESTION_SENTINEL: &str = "Invalid question given the data";

/// Substring the extractor matches on. Catches "Invalid" and "invalid" alike.
pub const INVALID_MARKER: &str = "nvalid";

/// Notice shown in place of a table when the model rejected the question.
pub const NO_QUERY_RESULT: &str = "no query result";

/// Instruction for the first model call: question -> executable SQL.
pub fn compose_generation_prompt(question: &str, schema: &SchemaDescription) -> String {
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("- `{}` ({})", c.name, c.description))
        .collect();

    format!(
        r#"You have a BigQuery table named `{table}` in the dataset `{dataset}` (fully qualified: `{qualified}`).
The table has these columns:
{columns}

Write an executable SQL query that answers the following question:
{question}

Default to the latest period {period} when the question does not name one.
Reply with executable SQL only, wrapped in a single ```sql fenced block.
If the given input is an invalid question for this table, reply exactly: "{sentinel}""#,
        table = schema.table_name,
        dataset = schema.dataset_name,
        qualified = schema.qualified_name(),
        columns = columns.join("\n"),
        question = question,
        period = schema.default_period,
        sentinel = INVALID_QUESTION_SENTINEL,
    )
}

/// Instruction for the second model call: explain the result in the asker's language.
pub fn compose_analysis_prompt(question: &str, sql: &str, table: &str) -> String {
    format!(
        r#"You received a question from an analyst.
A SQL query was executed for them and the result is given as a Markdown table.
Analyze the table and explain the result. Answer the analyst's question: {question}

The SQL that was run was this:
{sql}

The result was this Markdown table:

```
{table}
```
Provide a detailed but short answer, addressing the question, the SQL and the table.
Reply in the same language as the question: {question}"#,
        question = question,
        sql = sql,
        table = table,
    )
}
