//! Row search: field projection and predicates
//!
//! A search walks every row of a shard inside one read snapshot. For each
//! row the shard extracts the fields named in a [`FieldIndex`] into a
//! `Vec<Val>`, the compiled [`Predicate`] decides whether the row matches,
//! and matching rows are handed to the caller's consumer.
//!
//! Criteria are never used to narrow the key range; every search is a full
//! scan.

use std::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::value::Val;

/// Ordered set of field names, mapping each to its column in an extracted row.
#[derive(Debug, Clone, Default)]
pub struct FieldIndex {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl FieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index over `names`, in order.
    pub fn of<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut index = Self::new();
        for name in names {
            index.create(name);
        }
        index
    }

    /// Position of `name`, adding it as a new column if absent.
    pub fn create(&mut self, name: &str) -> usize {
        if let Some(&pos) = self.positions.get(name) {
            return pos;
        }
        let pos = self.names.len();
        self.names.push(name.to_string());
        self.positions.insert(name.to_string(), pos);
        pos
    }

    pub fn get_pos(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn fields(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Test applied to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Equals(Val),
    NotEquals(Val),
    GreaterThan(Val),
    GreaterOrEqual(Val),
    LessThan(Val),
    LessOrEqual(Val),
    /// Inclusive on both ends.
    Between(Val, Val),
    IsNull,
    IsNotNull,
    /// Substring match on the text form of the field.
    Contains(String),
}

impl Condition {
    fn test(&self, v: &Val) -> bool {
        use std::cmp::Ordering::*;
        // Only null is comparable to null; comparisons never match it.
        let cmp = |other: &Val| if v.is_null() { None } else { v.compare(other) };
        match self {
            Condition::Equals(o) => cmp(o) == Some(Equal),
            Condition::NotEquals(o) => !v.is_null() && cmp(o) != Some(Equal),
            Condition::GreaterThan(o) => cmp(o) == Some(Greater),
            Condition::GreaterOrEqual(o) => matches!(cmp(o), Some(Greater | Equal)),
            Condition::LessThan(o) => cmp(o) == Some(Less),
            Condition::LessOrEqual(o) => matches!(cmp(o), Some(Less | Equal)),
            Condition::Between(lo, hi) => {
                matches!(cmp(lo), Some(Greater | Equal)) && matches!(cmp(hi), Some(Less | Equal))
            }
            Condition::IsNull => v.is_null(),
            Condition::IsNotNull => !v.is_null(),
            Condition::Contains(needle) => match v {
                Val::Null => false,
                Val::String(s) => s.contains(needle.as_str()),
                other => other.to_string().contains(needle.as_str()),
            },
        }
    }
}

/// `field <condition>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionTerm {
    pub field: String,
    pub condition: Condition,
}

/// Boolean expression tree over terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpressionItem {
    And(Vec<ExpressionItem>),
    Or(Vec<ExpressionItem>),
    Not(Box<ExpressionItem>),
    Term(ExpressionTerm),
}

impl ExpressionItem {
    pub fn term(field: &str, condition: Condition) -> Self {
        ExpressionItem::Term(ExpressionTerm { field: field.to_string(), condition })
    }

    fn compile(&self, fields: &mut FieldIndex) -> Predicate {
        match self {
            ExpressionItem::And(items) => {
                Predicate::And(items.iter().map(|i| i.compile(fields)).collect())
            }
            ExpressionItem::Or(items) => {
                Predicate::Or(items.iter().map(|i| i.compile(fields)).collect())
            }
            ExpressionItem::Not(item) => Predicate::Not(Box::new(item.compile(fields))),
            ExpressionItem::Term(term) => Predicate::Term {
                pos: fields.create(&term.field),
                condition: term.condition.clone(),
            },
        }
    }
}

/// Search criteria. No expression matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionCriteria {
    pub expression: Option<ExpressionItem>,
}

impl ExpressionCriteria {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(expression: ExpressionItem) -> Self {
        Self { expression: Some(expression) }
    }

    /// Compile into a predicate over rows extracted with `fields`. Fields
    /// the expression refers to are appended to `fields` if missing, so the
    /// shard extracts them too.
    pub fn compile(&self, fields: &mut FieldIndex) -> Predicate {
        match &self.expression {
            None => Predicate::True,
            Some(item) => item.compile(fields),
        }
    }
}

/// Compiled criteria, evaluated against an extracted row.
#[derive(Clone, PartialEq)]
pub enum Predicate {
    True,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Term { pos: usize, condition: Condition },
}

impl Predicate {
    pub fn test(&self, row: &[Val]) -> bool {
        match self {
            Predicate::True => true,
            Predicate::And(items) => items.iter().all(|p| p.test(row)),
            Predicate::Or(items) => items.iter().any(|p| p.test(row)),
            Predicate::Not(item) => !item.test(row),
            Predicate::Term { pos, condition } => {
                condition.test(row.get(*pos).unwrap_or(&Val::Null))
            }
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::True => write!(f, "true"),
            Predicate::And(items) => f.debug_tuple("and").field(items).finish(),
            Predicate::Or(items) => f.debug_tuple("or").field(items).finish(),
            Predicate::Not(item) => f.debug_tuple("not").field(item).finish(),
            Predicate::Term { pos, condition } => write!(f, "${} {:?}", pos, condition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_index() {
        let mut index = FieldIndex::of(["Key", "Value"]);
        assert_eq!(index.create("Value"), 1);
        assert_eq!(index.create("Average"), 2);
        assert_eq!(index.get_pos("Key"), Some(0));
        assert_eq!(index.get_pos("Missing"), None);
        assert_eq!(index.fields(), ["Key", "Value", "Average"]);
    }

    #[test]
    fn test_compile_adds_referenced_fields() {
        let mut index = FieldIndex::of(["Key"]);
        let criteria = ExpressionCriteria::new(ExpressionItem::And(vec![
            ExpressionItem::term("Count", Condition::GreaterThan(Val::Long(2))),
            ExpressionItem::term("Key", Condition::Equals(Val::string("cpu"))),
        ]));
        let predicate = criteria.compile(&mut index);
        assert_eq!(index.fields(), ["Key", "Count"]);

        assert!(predicate.test(&[Val::string("cpu"), Val::Long(3)]));
        assert!(!predicate.test(&[Val::string("cpu"), Val::Long(2)]));
        assert!(!predicate.test(&[Val::string("mem"), Val::Long(3)]));
    }

    #[test]
    fn test_conditions() {
        let five = Val::Integer(5);
        assert!(Condition::Between(Val::Long(5), Val::Long(9)).test(&five));
        assert!(!Condition::Between(Val::Long(6), Val::Long(9)).test(&five));
        assert!(Condition::LessOrEqual(Val::Double(5.0)).test(&five));
        assert!(Condition::NotEquals(Val::Integer(4)).test(&five));
        assert!(Condition::Contains("ell".into()).test(&Val::string("hello")));
        assert!(Condition::IsNull.test(&Val::Null));
        assert!(!Condition::Equals(Val::Null).test(&Val::Null));
        assert!(!Condition::NotEquals(Val::Integer(1)).test(&Val::Null));
        assert!(!Condition::LessThan(Val::Integer(1)).test(&Val::Null));
    }

    #[test]
    fn test_or_not_and_all() {
        let mut index = FieldIndex::new();
        let predicate = ExpressionCriteria::new(ExpressionItem::Or(vec![
            ExpressionItem::Not(Box::new(ExpressionItem::term("A", Condition::IsNotNull))),
            ExpressionItem::term("A", Condition::Equals(Val::Boolean(true))),
        ]))
        .compile(&mut index);
        assert!(predicate.test(&[Val::Null]));
        assert!(predicate.test(&[Val::Boolean(true)]));
        assert!(!predicate.test(&[Val::Boolean(false)]));

        assert_eq!(ExpressionCriteria::all().compile(&mut index), Predicate::True);
    }

    #[test]
    fn test_criteria_json() {
        let criteria = ExpressionCriteria::new(ExpressionItem::term("Value", Condition::GreaterThan(Val::Long(10))));
        let json = serde_json::to_string(&criteria).unwrap();
        let back: ExpressionCriteria = serde_json::from_str(&json).unwrap();
        assert_eq!(back, criteria);
    }
}
