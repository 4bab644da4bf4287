//! Text of the staged answer sections.

use std::fmt::Display;

use dbchat_core::types::{ChartType, QueryResult};

pub const THINKING: &str = "🤔 Thinking...\n\n";

pub const NO_RECORDS: &str =
    "No matching records were found for this query. Try widening the filters or checking the collection name.\n";

pub fn intent(intent: &str) -> String {
    format!("**Intent:** {}\n", intent)
}

pub fn reasoning(reasoning: &str) -> String {
    format!("**Reasoning:** {}\n\n", reasoning)
}

pub fn query(query_text: &str) -> String {
    format!("**Query:**\n```js\n{}\n```\n\n", query_text)
}

pub fn result(result: &QueryResult) -> String {
    let pretty = serde_json::to_string_pretty(&result.to_json()).unwrap_or_default();
    format!("**Result:**\n```json\n{}\n```\n\n", pretty)
}

pub fn summary(summary: &str) -> String {
    format!("**Summary:**\n{}\n", summary)
}

pub fn chart_offer(chart_type: ChartType) -> String {
    format!(
        "\nWould you like me to show this result as a {} chart?\n",
        chart_type
    )
}

pub fn database_error(err: &dyn Display) -> String {
    format!("❌ **Database error:** {}\n", err)
}

pub fn error(err: &dyn Display) -> String {
    format!("❌ Error: {}\n", err)
}

/// Split a reply into word chunks for paced delivery. Concatenating the
/// chunks restores the reply plus one trailing space.
pub fn words(reply: &str) -> Vec<String> {
    reply.split(' ').map(|word| format!("{} ", word)).collect()
}
