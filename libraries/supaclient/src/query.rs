use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::Row;

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    /// Case-insensitive pattern match. `%` matches any run of characters, `_` any one character.
    ILike(String, String),
    /// Strictly less than.
    Lt(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    /// Case-insensitive substring match on `column`.
    pub fn contains(column: &str, needle: &str) -> Self {
        Filter::ILike(column.to_string(), format!("%{needle}%"))
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(column.to_string(), value.into())
    }

    pub fn one_of<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(column, _)
            | Filter::ILike(column, _)
            | Filter::Lt(column, _)
            | Filter::In(column, _) => column,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let Some(cell) = row.get(self.column()) else {
            return false;
        };
        match self {
            Filter::Eq(_, value) => values_equal(cell, value),
            Filter::ILike(_, pattern) => cell
                .as_str()
                .is_some_and(|text| ilike_matches(pattern, text)),
            Filter::Lt(_, value) => compare_values(cell, value) == Some(Ordering::Less),
            Filter::In(_, values) => values.iter().any(|value| values_equal(cell, value)),
        }
    }

    /// The `(column, operator.value)` pair PostgREST expects in the query string.
    pub fn to_postgrest(&self) -> (String, String) {
        let rendered = match self {
            Filter::Eq(_, value) => format!("eq.{}", render_value(value)),
            Filter::ILike(_, pattern) => format!("ilike.{}", pattern.replace('%', "*")),
            Filter::Lt(_, value) => format!("lt.{}", render_value(value)),
            Filter::In(_, values) => format!(
                "in.({})",
                values
                    .iter()
                    .map(render_list_item)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        };
        (self.column().to_string(), rendered)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct RowQuery {
    pub table: String,
    /// Comma-separated column list; `None` selects every column.
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_postgrest_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            self.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];
        params.extend(self.filters.iter().map(Filter::to_postgrest));
        if let Some(order) = &self.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{direction}", order.column)));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }

    /// Applies the query to an in-memory table.
    pub fn run(&self, rows: &[Row]) -> Vec<Row> {
        let mut selected: Vec<Row> = rows
            .iter()
            .filter(|row| self.filters.iter().all(|filter| filter.matches(row)))
            .cloned()
            .collect();

        if let Some(order) = &self.order {
            selected.sort_by(|a, b| {
                let ordering = match (a.get(&order.column), b.get(&order.column)) {
                    (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }

        match self.columns.as_deref() {
            None | Some("*") => selected,
            Some(columns) => {
                let wanted: Vec<&str> = columns.split(',').map(str::trim).collect();
                selected
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .filter(|(column, _)| wanted.contains(&column.as_str()))
                            .collect()
                    })
                    .collect()
            }
        }
    }
}

/// Orders two cells. Numbers compare numerically, strings that are both RFC 3339 timestamps
/// compare as instants, other strings lexicographically. Mixed kinds are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => {
            match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => Some(a.cmp(b)),
            }
        }
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn render_list_item(value: &Value) -> String {
    let text = render_value(value);
    if text.contains([',', '(', ')', '"', ' ']) {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text
    }
}

fn ilike_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    // matched[j]: pattern[..i] matches text[..j]
    let mut matched = vec![false; text.len() + 1];
    matched[0] = true;
    for symbol in &pattern {
        let mut next = vec![false; text.len() + 1];
        match symbol {
            '%' => {
                let mut reachable = false;
                for j in 0..=text.len() {
                    reachable |= matched[j];
                    next[j] = reachable;
                }
            }
            '_' => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1];
                }
            }
            literal => {
                for j in 1..=text.len() {
                    next[j] = matched[j - 1] && text[j - 1] == *literal;
                }
            }
        }
        matched = next;
    }
    matched[text.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_ilike_is_case_insensitive_substring() {
        assert!(ilike_matches("%bat%", "Old Batumi Port"));
        assert!(ilike_matches("%", ""));
        assert!(ilike_matches("b_t%", "bath"));
        assert!(!ilike_matches("%tbilisi%", "Batumi"));
        assert!(!ilike_matches("bat", "batumi"));
    }

    #[test]
    fn test_lt_compares_timestamps_as_instants() {
        let filter = Filter::lt("created_at", "2024-05-01T10:00:00Z");
        assert!(filter.matches(&row(json!({"created_at": "2024-05-01T09:59:59.999999+00:00"}))));
        assert!(!filter.matches(&row(json!({"created_at": "2024-05-01T10:00:00.000000+00:00"}))));
    }

    #[test]
    fn test_missing_column_never_matches() {
        assert!(!Filter::eq("direction_id", "tbilisi").matches(&row(json!({"id": "1"}))));
    }

    #[test]
    fn test_run_orders_limits_and_projects() {
        let rows = vec![
            row(json!({"id": "a", "n": 1, "title": "x"})),
            row(json!({"id": "b", "n": 3, "title": "y"})),
            row(json!({"id": "c", "n": 2, "title": "z"})),
        ];
        let result = RowQuery::from("t")
            .columns("id, n")
            .order_by("n", false)
            .limit(2)
            .run(&rows);
        assert_eq!(
            result,
            vec![row(json!({"id": "b", "n": 3})), row(json!({"id": "c", "n": 2}))]
        );
    }

    #[test]
    fn test_postgrest_rendering() {
        let query = RowQuery::from("locations")
            .filter(Filter::eq("direction_id", "tbilisi"))
            .filter(Filter::contains("title", "old town"))
            .filter(Filter::one_of("id", ["a", "b,c"]))
            .order_by("created_at", false)
            .limit(9);

        assert_eq!(
            query.to_postgrest_params(),
            vec![
                ("select".to_string(), "*".to_string()),
                ("direction_id".to_string(), "eq.tbilisi".to_string()),
                ("title".to_string(), "ilike.*old town*".to_string()),
                ("id".to_string(), "in.(a,\"b,c\")".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "9".to_string()),
            ]
        );
    }
}
