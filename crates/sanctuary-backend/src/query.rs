//! Row selection for `select`, rendered as PostgREST query parameters.

use std::cmp::Ordering;

use serde_json::Value;

use sanctuary_shared::constants::{COLUMN_IS_PRIVATE, COLUMN_USER_ID};
use sanctuary_shared::protocol::value_matches;
use sanctuary_shared::Visibility;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }
}

/// `column = value` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: String,
    pub value: String,
}

impl Condition {
    pub fn new(column: &str, value: impl Into<String>) -> Self {
        Self {
            column: column.to_string(),
            value: value.into(),
        }
    }

    fn render(&self) -> String {
        format!("{}.eq.{}", self.column, self.value)
    }

    pub fn matches(&self, row: &Value) -> bool {
        row.get(&self.column)
            .is_some_and(|value| value_matches(value, &self.value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Projection; `None` selects `*`.
    pub select: Option<String>,
    /// All must hold.
    pub eq: Vec<Condition>,
    /// At least one must hold, when non-empty.
    pub any_of: Vec<Condition>,
    pub order: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, projection: &str) -> Self {
        self.select = Some(projection.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.eq.push(Condition::new(column, value));
        self
    }

    pub fn any_of(mut self, conditions: Vec<Condition>) -> Self {
        self.any_of = conditions;
        self
    }

    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.order = Some((column.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restrict to the rows `visibility` allows.
    pub fn visible_to(self, visibility: &Visibility) -> Self {
        match visibility {
            Visibility::Everyone => self,
            Visibility::PublicOnly => self.eq(COLUMN_IS_PRIVATE, "false"),
            Visibility::PublicOrOwnedBy(actor) => self.any_of(vec![
                Condition::new(COLUMN_IS_PRIVATE, "false"),
                Condition::new(COLUMN_USER_ID, actor.as_str()),
            ]),
        }
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            self.select.clone().unwrap_or_else(|| "*".to_string()),
        )];

        for condition in &self.eq {
            params.push((condition.column.clone(), format!("eq.{}", condition.value)));
        }
        if !self.any_of.is_empty() {
            let group: Vec<String> = self.any_of.iter().map(Condition::render).collect();
            params.push(("or".to_string(), format!("({})", group.join(","))));
        }
        if let Some((column, direction)) = &self.order {
            params.push(("order".to_string(), format!("{column}.{}", direction.as_str())));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }

    /// Whether `row` passes the filters (projection, order and limit aside).
    pub fn matches(&self, row: &Value) -> bool {
        self.eq.iter().all(|c| c.matches(row))
            && (self.any_of.is_empty() || self.any_of.iter().any(|c| c.matches(row)))
    }

    /// Filter, order and truncate `rows` the way the server would.
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut selected: Vec<Value> = rows.into_iter().filter(|row| self.matches(row)).collect();

        if let Some((column, direction)) = &self.order {
            selected.sort_by(|a, b| {
                let ordering = compare_values(a.get(column), b.get(column));
                match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        // Nulls sort last ascending, as in Postgres.
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sanctuary_shared::ActorId;
    use serde_json::json;

    #[test]
    fn test_render_params() {
        let query = Query::new()
            .select("*,profiles:user_id(username,avatar_url)")
            .eq("stream_id", "s1")
            .order_by("created_at", Direction::Descending)
            .limit(50);

        assert_eq!(
            query.to_params(),
            vec![
                ("select".to_string(), "*,profiles:user_id(username,avatar_url)".to_string()),
                ("stream_id".to_string(), "eq.s1".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn test_visibility_renders_or_group() {
        let query = Query::new().visible_to(&Visibility::PublicOrOwnedBy(ActorId::from("u1")));
        assert!(query
            .to_params()
            .contains(&("or".to_string(), "(is_private.eq.false,user_id.eq.u1)".to_string())));

        let public = Query::new().visible_to(&Visibility::PublicOnly);
        assert!(public
            .to_params()
            .contains(&("is_private".to_string(), "eq.false".to_string())));
    }

    #[test]
    fn test_apply_filters_orders_and_limits() {
        let rows = vec![
            json!({"id": "a", "is_private": false, "user_id": "x", "created_at": "2024-01-01T00:00:01Z"}),
            json!({"id": "b", "is_private": true, "user_id": "u1", "created_at": "2024-01-01T00:00:03Z"}),
            json!({"id": "c", "is_private": true, "user_id": "x", "created_at": "2024-01-01T00:00:02Z"}),
            json!({"id": "d", "is_private": false, "user_id": "x", "created_at": "2024-01-01T00:00:04Z"}),
        ];

        let query = Query::new()
            .visible_to(&Visibility::PublicOrOwnedBy(ActorId::from("u1")))
            .order_by("created_at", Direction::Descending)
            .limit(2);

        let ids: Vec<String> = query
            .apply(rows.clone())
            .iter()
            .map(|row| row["id"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(ids, vec!["d", "b"]);

        let all = Query::new().apply(rows);
        assert_eq!(all.len(), 4);
    }
}
