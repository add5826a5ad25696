//! Expression-tree and value model shared by the codec and the connection layer.
//!
//! `Term` is the opaque query tree handed over by the query builder: a numeric
//! tag, positional child terms, and named child terms. `Datum` is the decoded
//! value model, including the pseudo-type values (binary, time, grouped data)
//! that the wire format spells as tagged JSON objects.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, FixedOffset};

use crate::protocol::term_type;

/// A decoded ReQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Datum>),
    Object(BTreeMap<String, Datum>),
    /// Decoded BINARY pseudo-type.
    Binary(Vec<u8>),
    /// Decoded TIME pseudo-type.
    Time(DateTime<FixedOffset>),
    /// Decoded GROUPED_DATA pseudo-type. Group keys are converted to an
    /// ordered/hashable form so they can serve as map keys.
    Grouped(BTreeMap<GroupKey, Datum>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Datum {
    fn from(value: bool) -> Self {
        Datum::Bool(value)
    }
}

impl From<i64> for Datum {
    fn from(value: i64) -> Self {
        Datum::Int(value)
    }
}

impl From<i32> for Datum {
    fn from(value: i32) -> Self {
        Datum::Int(value as i64)
    }
}

impl From<f64> for Datum {
    fn from(value: f64) -> Self {
        Datum::Float(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::String(value.to_string())
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Datum::String(value)
    }
}

impl From<Vec<u8>> for Datum {
    fn from(value: Vec<u8>) -> Self {
        Datum::Binary(value)
    }
}

impl From<Vec<Datum>> for Datum {
    fn from(value: Vec<Datum>) -> Self {
        Datum::Array(value)
    }
}

impl From<DateTime<FixedOffset>> for Datum {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Datum::Time(value)
    }
}

/// An f64 with total ordering and hashing, usable as a map key.
#[derive(Debug, Clone, Copy)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for OrderedFloat {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// A grouped-data key in hashable form.
///
/// Arrays become ordered tuples, objects become unordered sets of
/// `(key, value)` pairs. Numeric keys are canonicalized to f64.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKey {
    Null,
    Bool(bool),
    Number(OrderedFloat),
    String(String),
    Binary(Vec<u8>),
    Time(DateTime<FixedOffset>),
    Array(Vec<GroupKey>),
    Set(BTreeSet<(String, GroupKey)>),
}

impl GroupKey {
    /// Convert a decoded datum into its hashable key form.
    pub fn from_datum(datum: &Datum) -> GroupKey {
        match datum {
            Datum::Null => GroupKey::Null,
            Datum::Bool(b) => GroupKey::Bool(*b),
            Datum::Int(i) => GroupKey::Number(OrderedFloat(*i as f64)),
            Datum::Float(f) => GroupKey::Number(OrderedFloat(*f)),
            Datum::String(s) => GroupKey::String(s.clone()),
            Datum::Binary(b) => GroupKey::Binary(b.clone()),
            Datum::Time(t) => GroupKey::Time(*t),
            Datum::Array(items) => {
                GroupKey::Array(items.iter().map(GroupKey::from_datum).collect())
            }
            Datum::Object(map) => GroupKey::Set(
                map.iter()
                    .map(|(k, v)| (k.clone(), GroupKey::from_datum(v)))
                    .collect(),
            ),
            Datum::Grouped(groups) => GroupKey::Set(
                groups
                    .iter()
                    .map(|(k, v)| (format!("{k:?}"), GroupKey::from_datum(v)))
                    .collect(),
            ),
        }
    }

    /// Convert a key back into datum form, for re-encoding grouped data.
    pub fn to_datum(&self) -> Datum {
        match self {
            GroupKey::Null => Datum::Null,
            GroupKey::Bool(b) => Datum::Bool(*b),
            GroupKey::Number(OrderedFloat(f)) => {
                if f.fract() == 0.0 && f.abs() < (1i64 << 53) as f64 {
                    Datum::Int(*f as i64)
                } else {
                    Datum::Float(*f)
                }
            }
            GroupKey::String(s) => Datum::String(s.clone()),
            GroupKey::Binary(b) => Datum::Binary(b.clone()),
            GroupKey::Time(t) => Datum::Time(*t),
            GroupKey::Array(items) => Datum::Array(items.iter().map(GroupKey::to_datum).collect()),
            GroupKey::Set(pairs) => Datum::Object(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_datum()))
                    .collect(),
            ),
        }
    }
}

/// One node of the query expression tree.
///
/// The connection layer treats terms as opaque: it only serializes them and
/// attaches them to server-reported errors for backtrace rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Datum(Datum),
    Op {
        tag: u32,
        args: Vec<Term>,
        opts: BTreeMap<String, Term>,
    },
}

impl Term {
    pub fn op(tag: u32, args: Vec<Term>) -> Term {
        Term::Op {
            tag,
            args,
            opts: BTreeMap::new(),
        }
    }

    pub fn op_with(tag: u32, args: Vec<Term>, opts: BTreeMap<String, Term>) -> Term {
        Term::Op { tag, args, opts }
    }

    pub fn datum(value: impl Into<Datum>) -> Term {
        Term::Datum(value.into())
    }

    /// The DB term the connection injects for its default database.
    pub fn db(name: &str) -> Term {
        Term::op(term_type::DB, vec![Term::datum(name)])
    }
}

impl From<Datum> for Term {
    fn from(value: Datum) -> Self {
        Term::Datum(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_key_array_is_ordered() {
        let a = GroupKey::from_datum(&Datum::Array(vec![Datum::Int(1), Datum::Int(2)]));
        let b = GroupKey::from_datum(&Datum::Array(vec![Datum::Int(2), Datum::Int(1)]));
        assert_ne!(a, b);
    }

    #[test]
    fn group_key_object_is_unordered() {
        let mut m1 = BTreeMap::new();
        m1.insert("a".to_string(), Datum::Int(1));
        m1.insert("b".to_string(), Datum::Int(2));
        let mut m2 = BTreeMap::new();
        m2.insert("b".to_string(), Datum::Int(2));
        m2.insert("a".to_string(), Datum::Int(1));
        assert_eq!(
            GroupKey::from_datum(&Datum::Object(m1)),
            GroupKey::from_datum(&Datum::Object(m2))
        );
    }

    #[test]
    fn group_key_numbers_canonicalize() {
        assert_eq!(
            GroupKey::from_datum(&Datum::Int(1)),
            GroupKey::from_datum(&Datum::Float(1.0))
        );
    }

    #[test]
    fn group_key_round_trips_scalars() {
        for d in [
            Datum::Null,
            Datum::Bool(true),
            Datum::Int(42),
            Datum::String("k".to_string()),
        ] {
            assert_eq!(GroupKey::from_datum(&d).to_datum(), d);
        }
    }
}
