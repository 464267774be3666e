//! Ordered, uniquely named collections of values.

use crate::error::ValueError;
use crate::value::Value;

/// A mapping from non-empty field names to values that preserves insertion
/// order. Stages never mutate a record they receive; they build a new one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from `(name, value)` pairs, rejecting empty or
    /// repeated names.
    pub fn from_fields<I, S>(fields: I) -> Result<Self, ValueError>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let mut record = Record::new();
        for (name, value) in fields {
            record.insert(name, value)?;
        }
        Ok(record)
    }

    /// Append a field.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Result<(), ValueError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValueError::EmptyFieldName);
        }
        if self.contains(&name) {
            return Err(ValueError::DuplicateField(name));
        }
        self.fields.push((name, value));
        Ok(())
    }

    /// Builder form of [`Record::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<Self, ValueError> {
        self.insert(name, value.into())?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// A new record holding only the named fields, in the order given.
    /// Names that are absent are skipped.
    pub fn select<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Record {
        let fields = names
            .into_iter()
            .filter_map(|name| self.get(name).map(|v| (name.to_string(), v.clone())))
            .collect();
        Record { fields }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_is_preserved() {
        let record = Record::new()
            .with("b", 1i64)
            .unwrap()
            .with("a", 2i64)
            .unwrap()
            .with("c", 3i64)
            .unwrap();
        assert_eq!(record.names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_rejects_empty_and_duplicate_names() {
        let mut record = Record::new();
        assert_eq!(record.insert("", Value::Bool(true)), Err(ValueError::EmptyFieldName));
        record.insert("x", Value::Bool(true)).unwrap();
        assert_eq!(
            record.insert("x", Value::Bool(false)),
            Err(ValueError::DuplicateField("x".into()))
        );
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_select_projects_in_given_order() {
        let record = Record::from_fields(vec![
            ("a", Value::Int64(1)),
            ("b", Value::Int64(2)),
            ("c", Value::Int64(3)),
        ])
        .unwrap();
        let projected = record.select(["c", "missing", "a"]);
        assert_eq!(projected.names().collect::<Vec<_>>(), vec!["c", "a"]);
    }
}
