//! Document values
//!
//! A payload entry is a recursive tagged value. Reads coerce leniently
//! between scalar kinds; indexing into a value that is not a container is an
//! addressing error. JSON text goes through `serde_json`: the untagged
//! `Serialize` derive writes it and a visitor reads it back.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{IpaacaError, IpaacaResult};

/// Ordered string-keyed map of document values
pub type DocumentMap = BTreeMap<String, DocumentValue>;

/// Recursive document value
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DocumentValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<DocumentValue>),
    Map(DocumentMap),
}

/// One step of a path into a document
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "[{:?}]", k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Render a path for error messages, e.g. `a[0]["k"]`
pub fn describe_path(root: &str, path: &[PathSegment]) -> String {
    let mut out = root.to_string();
    for seg in path {
        out.push_str(&seg.to_string());
    }
    out
}

impl DocumentValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DocumentValue::Null => "null",
            DocumentValue::Bool(_) => "bool",
            DocumentValue::Integer(_) => "integer",
            DocumentValue::Float(_) => "float",
            DocumentValue::String(_) => "string",
            DocumentValue::List(_) => "list",
            DocumentValue::Map(_) => "map",
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, DocumentValue::Null)
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        matches!(self, DocumentValue::Bool(_))
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, DocumentValue::Integer(_) | DocumentValue::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, DocumentValue::String(_))
    }

    #[inline]
    pub fn is_list(&self) -> bool {
        matches!(self, DocumentValue::List(_))
    }

    #[inline]
    pub fn is_map(&self) -> bool {
        matches!(self, DocumentValue::Map(_))
    }

    #[inline]
    pub fn is_container(&self) -> bool {
        self.is_list() || self.is_map()
    }

    /// Number of elements of a list or map
    pub fn len(&self) -> IpaacaResult<usize> {
        match self {
            DocumentValue::List(items) => Ok(items.len()),
            DocumentValue::Map(map) => Ok(map.len()),
            other => Err(IpaacaError::TypeConversion(format!(
                "{} has no length",
                other.kind_name()
            ))),
        }
    }

    /// Textual form; containers render as compact JSON, null as ""
    pub fn to_text(&self) -> String {
        match self {
            DocumentValue::Null => String::new(),
            DocumentValue::Bool(b) => b.to_string(),
            DocumentValue::Integer(i) => i.to_string(),
            DocumentValue::Float(f) => f.to_string(),
            DocumentValue::String(s) => s.clone(),
            // Display only; serde_json writes non-finite floats as null here
            DocumentValue::List(_) | DocumentValue::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }

    /// Lenient integer interpretation
    pub fn to_int(&self) -> IpaacaResult<i64> {
        match self {
            DocumentValue::Null => Ok(0),
            DocumentValue::Bool(b) => Ok(*b as i64),
            DocumentValue::Integer(i) => Ok(*i),
            DocumentValue::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
            DocumentValue::String(s) => {
                let t = s.trim();
                if let Ok(i) = t.parse::<i64>() {
                    return Ok(i);
                }
                match t.parse::<f64>() {
                    Ok(f) if f.is_finite() => Ok(f.trunc() as i64),
                    _ => Err(conversion_error(self, "integer")),
                }
            }
            _ => Err(conversion_error(self, "integer")),
        }
    }

    /// Lenient float interpretation
    pub fn to_float(&self) -> IpaacaResult<f64> {
        match self {
            DocumentValue::Null => Ok(0.0),
            DocumentValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            DocumentValue::Integer(i) => Ok(*i as f64),
            DocumentValue::Float(f) => Ok(*f),
            DocumentValue::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| conversion_error(self, "float")),
            _ => Err(conversion_error(self, "float")),
        }
    }

    /// Lenient boolean interpretation
    pub fn to_bool(&self) -> IpaacaResult<bool> {
        match self {
            DocumentValue::Null => Ok(false),
            DocumentValue::Bool(b) => Ok(*b),
            DocumentValue::Integer(i) => Ok(*i != 0),
            DocumentValue::Float(f) => Ok(*f != 0.0),
            DocumentValue::String(s) => {
                let t = s.trim().to_ascii_lowercase();
                match t.as_str() {
                    "" | "false" | "no" | "0" => Ok(false),
                    "true" | "yes" | "1" => Ok(true),
                    _ => t
                        .parse::<f64>()
                        .map(|f| f != 0.0)
                        .map_err(|_| conversion_error(self, "bool")),
                }
            }
            _ => Err(conversion_error(self, "bool")),
        }
    }

    /// Elements of a list, each rendered as text
    pub fn to_string_list(&self) -> IpaacaResult<Vec<String>> {
        match self {
            DocumentValue::List(items) => Ok(items.iter().map(|v| v.to_text()).collect()),
            _ => Err(conversion_error(self, "list")),
        }
    }

    /// Resolve a path for reading. A missing map key reads as null.
    pub fn resolve(&self, path: &[PathSegment]) -> IpaacaResult<DocumentValue> {
        let mut current = self;
        for (depth, seg) in path.iter().enumerate() {
            match (seg, current) {
                (PathSegment::Index(i), DocumentValue::List(items)) => {
                    current = items.get(*i).ok_or_else(|| {
                        IpaacaError::Addressing(format!(
                            "index {} out of range (len {}) at depth {}",
                            i,
                            items.len(),
                            depth
                        ))
                    })?;
                }
                (PathSegment::Key(k), DocumentValue::Map(map)) => match map.get(k) {
                    Some(v) => current = v,
                    None => return Ok(DocumentValue::Null),
                },
                (seg, other) => return Err(addressing_error(seg, other)),
            }
        }
        Ok(current.clone())
    }

    /// Resolve a path for writing. A missing map key is created as null;
    /// list indices must already exist.
    pub fn resolve_mut(&mut self, path: &[PathSegment]) -> IpaacaResult<&mut DocumentValue> {
        let mut current = self;
        for seg in path {
            current = match (seg, current) {
                (PathSegment::Index(i), DocumentValue::List(items)) => {
                    let len = items.len();
                    items.get_mut(*i).ok_or_else(|| {
                        IpaacaError::Addressing(format!("index {} out of range (len {})", i, len))
                    })?
                }
                (PathSegment::Key(k), DocumentValue::Map(map)) => {
                    map.entry(k.clone()).or_insert(DocumentValue::Null)
                }
                (seg, other) => return Err(addressing_error(seg, other)),
            };
        }
        Ok(current)
    }

    /// Remove the element addressed by the last path segment
    pub fn remove_at(&mut self, path: &[PathSegment]) -> IpaacaResult<Option<DocumentValue>> {
        let Some((last, parent_path)) = path.split_last() else {
            return Err(IpaacaError::Addressing("empty path".into()));
        };
        let parent = self.resolve_mut(parent_path)?;
        match (last, parent) {
            (PathSegment::Index(i), DocumentValue::List(items)) => {
                if *i < items.len() {
                    Ok(Some(items.remove(*i)))
                } else {
                    Err(IpaacaError::Addressing(format!(
                        "index {} out of range (len {})",
                        i,
                        items.len()
                    )))
                }
            }
            (PathSegment::Key(k), DocumentValue::Map(map)) => Ok(map.remove(k)),
            (seg, other) => Err(addressing_error(seg, other)),
        }
    }

    /// True when no float in the tree is NaN or infinite
    pub fn is_finite(&self) -> bool {
        match self {
            DocumentValue::Float(f) => f.is_finite(),
            DocumentValue::List(items) => items.iter().all(DocumentValue::is_finite),
            DocumentValue::Map(map) => map.values().all(DocumentValue::is_finite),
            _ => true,
        }
    }

    /// Compact JSON text. NaN and infinities have no JSON form and are rejected.
    pub fn to_json_string(&self) -> IpaacaResult<String> {
        if !self.is_finite() {
            return Err(IpaacaError::TypeConversion(format!(
                "{} holds a non-finite float, which JSON cannot carry",
                self.kind_name()
            )));
        }
        serde_json::to_string(self).map_err(|e| IpaacaError::TypeConversion(e.to_string()))
    }

    /// Parse JSON text into a document value
    pub fn from_json_str(text: &str) -> IpaacaResult<Self> {
        serde_json::from_str::<DocumentValue>(text).map_err(|e| IpaacaError::JsonParsing(e.to_string()))
    }
}

fn conversion_error(value: &DocumentValue, target: &str) -> IpaacaError {
    IpaacaError::TypeConversion(format!(
        "cannot interpret {} {:?} as {}",
        value.kind_name(),
        value.to_text(),
        target
    ))
}

fn addressing_error(seg: &PathSegment, value: &DocumentValue) -> IpaacaError {
    IpaacaError::Addressing(format!("cannot index {} with {}", value.kind_name(), seg))
}

impl fmt::Display for DocumentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

struct DocumentVisitor;

impl<'de> Visitor<'de> for DocumentVisitor {
    type Value = DocumentValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON document")
    }

    fn visit_unit<E: de::Error>(self) -> Result<DocumentValue, E> {
        Ok(DocumentValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<DocumentValue, E> {
        Ok(DocumentValue::Null)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<DocumentValue, E> {
        Ok(DocumentValue::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, i: i64) -> Result<DocumentValue, E> {
        Ok(DocumentValue::Integer(i))
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> Result<DocumentValue, E> {
        i64::try_from(u)
            .map(DocumentValue::Integer)
            .map_err(|_| E::custom(format!("integer {} is out of range", u)))
    }

    fn visit_f64<E: de::Error>(self, f: f64) -> Result<DocumentValue, E> {
        Ok(DocumentValue::Float(f))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<DocumentValue, E> {
        Ok(DocumentValue::String(s.to_string()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<DocumentValue, E> {
        Ok(DocumentValue::String(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<DocumentValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(DocumentValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<DocumentValue, A::Error> {
        let mut map = DocumentMap::new();
        while let Some((key, value)) = access.next_entry::<String, DocumentValue>()? {
            map.insert(key, value);
        }
        Ok(DocumentValue::Map(map))
    }
}

impl<'de> Deserialize<'de> for DocumentValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DocumentVisitor)
    }
}

impl From<bool> for DocumentValue {
    fn from(b: bool) -> Self {
        DocumentValue::Bool(b)
    }
}

impl From<i32> for DocumentValue {
    fn from(i: i32) -> Self {
        DocumentValue::Integer(i as i64)
    }
}

impl From<i64> for DocumentValue {
    fn from(i: i64) -> Self {
        DocumentValue::Integer(i)
    }
}

impl From<u32> for DocumentValue {
    fn from(i: u32) -> Self {
        DocumentValue::Integer(i as i64)
    }
}

impl From<f32> for DocumentValue {
    fn from(f: f32) -> Self {
        DocumentValue::Float(f as f64)
    }
}

impl From<f64> for DocumentValue {
    fn from(f: f64) -> Self {
        DocumentValue::Float(f)
    }
}

impl From<&str> for DocumentValue {
    fn from(s: &str) -> Self {
        DocumentValue::String(s.to_string())
    }
}

impl From<String> for DocumentValue {
    fn from(s: String) -> Self {
        DocumentValue::String(s)
    }
}

impl From<&String> for DocumentValue {
    fn from(s: &String) -> Self {
        DocumentValue::String(s.clone())
    }
}

impl<T: Into<DocumentValue>> From<Vec<T>> for DocumentValue {
    fn from(items: Vec<T>) -> Self {
        DocumentValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<DocumentValue>> From<BTreeMap<String, T>> for DocumentValue {
    fn from(map: BTreeMap<String, T>) -> Self {
        DocumentValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<DocumentValue>> From<Option<T>> for DocumentValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DocumentValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> DocumentValue {
        DocumentValue::from_json_str(r#"["old", ["str", null], 3, {"key1": "value1"}]"#).unwrap()
    }

    #[test]
    fn test_lenient_scalar_coercion() {
        let f = DocumentValue::from("12.5000");
        assert_eq!(f.to_float().unwrap(), 12.5);
        assert_eq!(f.to_int().unwrap(), 12);
        assert_eq!(f.to_text(), "12.5000");

        assert_eq!(DocumentValue::from(100).to_text(), "100");
        assert_eq!(DocumentValue::from(7).to_float().unwrap(), 7.0);
        assert_eq!(DocumentValue::from(2.9).to_int().unwrap(), 2);
        assert!(DocumentValue::from(true).to_int().unwrap() == 1);
        assert!(DocumentValue::from("yes").to_bool().unwrap());
        assert!(!DocumentValue::from("0").to_bool().unwrap());
        assert!(DocumentValue::from("2.5").to_bool().unwrap());
    }

    #[test]
    fn test_null_defaults() {
        let null = DocumentValue::Null;
        assert_eq!(null.to_text(), "");
        assert_eq!(null.to_int().unwrap(), 0);
        assert_eq!(null.to_float().unwrap(), 0.0);
        assert!(!null.to_bool().unwrap());
    }

    #[test]
    fn test_conversion_failures() {
        let s = DocumentValue::from("simpleString");
        assert!(matches!(s.to_int(), Err(IpaacaError::TypeConversion(_))));
        assert!(matches!(s.to_float(), Err(IpaacaError::TypeConversion(_))));
        assert!(matches!(s.to_bool(), Err(IpaacaError::TypeConversion(_))));

        let list = DocumentValue::from(vec![1, 2]);
        assert!(matches!(list.to_int(), Err(IpaacaError::TypeConversion(_))));
        assert_eq!(list.to_text(), "[1,2]");
    }

    #[test]
    fn test_resolve_paths() {
        let doc = sample();
        let inner = doc
            .resolve(&[PathSegment::Index(1), PathSegment::Index(0)])
            .unwrap();
        assert_eq!(inner, DocumentValue::from("str"));

        let missing = doc
            .resolve(&[PathSegment::Index(3), PathSegment::Key("nope".into())])
            .unwrap();
        assert!(missing.is_null());

        let through_scalar = doc.resolve(&[PathSegment::Index(2), PathSegment::Index(0)]);
        assert!(matches!(through_scalar, Err(IpaacaError::Addressing(_))));

        let out_of_range = doc.resolve(&[PathSegment::Index(9)]);
        assert!(matches!(out_of_range, Err(IpaacaError::Addressing(_))));
    }

    #[test]
    fn test_resolve_mut_and_remove() {
        let mut doc = sample();
        *doc.resolve_mut(&[PathSegment::Index(3), PathSegment::Key("addkey".into())])
            .unwrap() = DocumentValue::from("addvalue");
        assert_eq!(
            doc.resolve(&[PathSegment::Index(3), PathSegment::Key("addkey".into())])
                .unwrap(),
            DocumentValue::from("addvalue")
        );

        let removed = doc.remove_at(&[PathSegment::Index(0)]).unwrap();
        assert_eq!(removed, Some(DocumentValue::from("old")));
        assert_eq!(doc.len().unwrap(), 3);

        assert!(doc
            .resolve_mut(&[PathSegment::Key("k".into())])
            .is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = DocumentValue::from_json_str("{\"unterminated\": ").unwrap_err();
        assert!(matches!(err, IpaacaError::JsonParsing(_)));
    }

    #[test]
    fn test_json_floats_are_exact() {
        let value = DocumentValue::List(vec![
            DocumentValue::Float(-915384901.6932595),
            DocumentValue::Float(0.30000000000000004),
            DocumentValue::Float(2.0),
        ]);
        let text = value.to_json_string().unwrap();
        assert_eq!(DocumentValue::from_json_str(&text).unwrap(), value);
    }

    #[test]
    fn test_json_rejects_unrepresentable_numbers() {
        let mut map = DocumentMap::new();
        map.insert("x".into(), DocumentValue::Float(f64::NAN));
        let nested = DocumentValue::List(vec![DocumentValue::Map(map)]);
        assert!(!nested.is_finite());
        assert!(matches!(nested.to_json_string(), Err(IpaacaError::TypeConversion(_))));
        assert!(DocumentValue::Float(f64::INFINITY).to_json_string().is_err());

        let err = DocumentValue::from_json_str("18446744073709551615").unwrap_err();
        assert!(matches!(err, IpaacaError::JsonParsing(_)));
        assert_eq!(
            DocumentValue::from_json_str("-9223372036854775808").unwrap(),
            DocumentValue::Integer(i64::MIN)
        );
    }

    #[test]
    fn test_describe_path() {
        let path = [PathSegment::Index(0), PathSegment::Key("k".into())];
        assert_eq!(describe_path("a", &path), "a[0][\"k\"]");
    }

    fn arb_value() -> impl Strategy<Value = DocumentValue> {
        let leaf = prop_oneof![
            Just(DocumentValue::Null),
            any::<bool>().prop_map(DocumentValue::Bool),
            any::<i64>().prop_map(DocumentValue::Integer),
            (-1.0e9f64..1.0e9f64).prop_map(DocumentValue::Float),
            "[a-z0-9 ]{0,8}".prop_map(DocumentValue::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(DocumentValue::List),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(DocumentValue::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_json_text_roundtrip(value in arb_value()) {
            let text = value.to_json_string().unwrap();
            let parsed = DocumentValue::from_json_str(&text).unwrap();
            // Whole floats come back as floats because serde_json keeps the ".0"
            prop_assert_eq!(parsed, value);
        }
    }
}
