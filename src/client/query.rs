//! JSON:API query construction
//!
//! Builds the `filter`, `include`, `fields[...]`, `additional-fields[...]`,
//! `page[...]` and `sort` parameters understood by the upstream.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::error::ApiError;
use crate::models::TimeRange;

/// Comparison operator in the filter DSL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    Any,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Equals => "equals",
            FilterOp::GreaterThan => "greater-than",
            FilterOp::LessThan => "less-than",
            FilterOp::GreaterOrEqual => "greater-or-equal",
            FilterOp::LessOrEqual => "less-or-equal",
            FilterOp::Contains => "contains",
            FilterOp::Any => "any",
        }
    }
}

/// Right-hand side of a filter predicate
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    List(Vec<String>),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Integer(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(value: DateTime<Utc>) -> Self {
        FilterValue::Timestamp(value)
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "\\'"))
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Text(s) => f.write_str(&quote(s)),
            FilterValue::Integer(n) => write!(f, "{}", n),
            FilterValue::Bool(b) => write!(f, "{}", b),
            FilterValue::Timestamp(ts) => f.write_str(&format_timestamp(*ts)),
            FilterValue::List(items) => {
                let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
                write!(f, "[{}]", quoted.join(","))
            }
        }
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One `op(field,value)` predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.op.as_str(), self.field, self.value)
    }
}

/// Query parameters for one listing request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiQuery {
    filters: Vec<Filter>,
    include: Vec<String>,
    fields: BTreeMap<String, Vec<String>>,
    additional_fields: BTreeMap<String, Vec<String>>,
    page_size: Option<u32>,
    page_cursor: Option<String>,
    sort: Option<String>,
}

impl ApiQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter predicate; predicates are AND-ed upstream
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<FilterValue>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Restrict `field` to a closed range
    ///
    /// The upstream only offers strict comparisons here, so each bound is
    /// widened by 1ms to keep records stamped exactly on a bound.
    pub fn date_range(self, field: &str, range: TimeRange) -> Self {
        self.filter(field, FilterOp::GreaterThan, range.start - Duration::milliseconds(1))
            .filter(field, FilterOp::LessThan, range.end + Duration::milliseconds(1))
    }

    /// Restrict `field` to values at or after `since`
    pub fn since(self, field: &str, since: DateTime<Utc>) -> Self {
        self.filter(field, FilterOp::GreaterThan, since - Duration::milliseconds(1))
    }

    pub fn include(mut self, related: impl Into<String>) -> Self {
        self.include.push(related.into());
        self
    }

    /// Sparse fieldset for a resource type
    pub fn fields<I, S>(mut self, resource_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields
            .entry(resource_type.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Opt-in fields that are not returned by default
    pub fn additional_fields<I, S>(mut self, resource_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.additional_fields
            .entry(resource_type.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn page_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.page_cursor = Some(cursor.into());
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Reject malformed input before it reaches the network
    pub fn validate(&self) -> Result<(), ApiError> {
        if let Some(filter) = self.filters.iter().find(|f| f.field.trim().is_empty()) {
            return Err(ApiError::InvalidRequest(format!(
                "filter '{}' has an empty field name",
                filter
            )));
        }
        if self.page_size == Some(0) {
            return Err(ApiError::InvalidRequest(
                "page[size] must be at least 1".to_string(),
            ));
        }
        for (resource_type, fields) in self.fields.iter().chain(self.additional_fields.iter()) {
            if resource_type.trim().is_empty() || fields.iter().any(|f| f.trim().is_empty()) {
                return Err(ApiError::InvalidRequest(format!(
                    "empty sparse field for '{}'",
                    resource_type
                )));
            }
        }
        Ok(())
    }

    /// Serialize to query pairs in a stable order
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();

        if !self.filters.is_empty() {
            let dsl: Vec<String> = self.filters.iter().map(Filter::to_string).collect();
            pairs.push(("filter".to_string(), dsl.join(",")));
        }
        if !self.include.is_empty() {
            pairs.push(("include".to_string(), self.include.join(",")));
        }
        for (resource_type, fields) in &self.fields {
            pairs.push((format!("fields[{}]", resource_type), fields.join(",")));
        }
        for (resource_type, fields) in &self.additional_fields {
            pairs.push((
                format!("additional-fields[{}]", resource_type),
                fields.join(","),
            ));
        }
        if let Some(size) = self.page_size {
            pairs.push(("page[size]".to_string(), size.to_string()));
        }
        if let Some(cursor) = &self.page_cursor {
            pairs.push(("page[cursor]".to_string(), cursor.clone()));
        }
        if let Some(sort) = &self.sort {
            pairs.push(("sort".to_string(), sort.clone()));
        }

        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn pair<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    // Test 1: Filter DSL formatting
    #[test]
    fn test_filter_formatting() {
        let query = ApiQuery::new()
            .filter("messages.channel", FilterOp::Equals, "email")
            .filter("archived", FilterOp::Equals, false)
            .filter("profile_count", FilterOp::GreaterThan, 10i64);

        let pairs = query.to_pairs();
        assert_eq!(
            pair(&pairs, "filter"),
            Some("equals(messages.channel,'email'),equals(archived,false),greater-than(profile_count,10)")
        );
    }

    // Test 2: List and quoted values
    #[test]
    fn test_list_and_escaped_values() {
        let value = FilterValue::List(vec!["draft".to_string(), "live".to_string()]);
        assert_eq!(value.to_string(), "['draft','live']");
        assert_eq!(FilterValue::from("it's").to_string(), r"'it\'s'");
    }

    // Test 3: Date range bounds are widened by one millisecond
    #[test]
    fn test_date_range_widens_bounds() {
        let range = TimeRange::days(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        );
        let query = ApiQuery::new().date_range("updated_at", range);

        assert_eq!(
            query.filters()[0].to_string(),
            "greater-than(updated_at,2024-12-31T23:59:59.999Z)"
        );
        assert_eq!(
            query.filters()[1].to_string(),
            "less-than(updated_at,2025-02-01T00:00:00.000Z)"
        );

        // both boundary instants satisfy the strict comparisons
        let first = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap();
        match (&query.filters()[0].value, &query.filters()[1].value) {
            (FilterValue::Timestamp(lower), FilterValue::Timestamp(upper)) => {
                assert!(first > *lower && first < *upper);
                assert!(last > *lower && last < *upper);
            }
            _ => panic!("Expected timestamp bounds"),
        }
    }

    // Test 4: Incremental lower bound
    #[test]
    fn test_since_filter() {
        let since = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let query = ApiQuery::new().since("updated", since);
        assert_eq!(
            query.filters()[0].to_string(),
            "greater-than(updated,2025-03-01T11:59:59.999Z)"
        );
    }

    // Test 5: Include, sparse fieldsets, paging and sort
    #[test]
    fn test_full_parameter_shape() {
        let query = ApiQuery::new()
            .include("campaign-messages")
            .fields("campaign", ["name", "status"])
            .fields("campaign-message", ["label"])
            .additional_fields("segment", ["profile_count"])
            .page_size(50)
            .page_cursor("abc")
            .sort("-updated_at");

        let pairs = query.to_pairs();
        assert_eq!(pair(&pairs, "include"), Some("campaign-messages"));
        assert_eq!(pair(&pairs, "fields[campaign]"), Some("name,status"));
        assert_eq!(pair(&pairs, "fields[campaign-message]"), Some("label"));
        assert_eq!(
            pair(&pairs, "additional-fields[segment]"),
            Some("profile_count")
        );
        assert_eq!(pair(&pairs, "page[size]"), Some("50"));
        assert_eq!(pair(&pairs, "page[cursor]"), Some("abc"));
        assert_eq!(pair(&pairs, "sort"), Some("-updated_at"));
        assert_eq!(pair(&pairs, "filter"), None);
    }

    // Test 6: Malformed input is rejected
    #[test]
    fn test_validate_rejects_malformed_input() {
        assert!(ApiQuery::new().page_size(10).validate().is_ok());

        assert!(matches!(
            ApiQuery::new().page_size(0).validate(),
            Err(ApiError::InvalidRequest(_))
        ));
        assert!(matches!(
            ApiQuery::new()
                .filter(" ", FilterOp::Equals, "x")
                .validate(),
            Err(ApiError::InvalidRequest(_))
        ));
        assert!(matches!(
            ApiQuery::new().fields("flow", [""]).validate(),
            Err(ApiError::InvalidRequest(_))
        ));
    }
}
