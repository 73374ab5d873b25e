//! Binding between caller record types and stored documents.
//!
//! A record type is checked once, when a [`ValidatedSchema`] is built: the
//! type's `Deserialize` implementation is driven once per bound field by a
//! tracing deserializer that offers only that key and records which type the
//! field asks for. Nothing is coerced. After that, per-document work is plain map
//! access through the validated field names plus one `serde_json` decode.
use std::marker::PhantomData;

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer, MapAccess, Visitor,
    value::{Error as TraceError, StrDeserializer},
};
use serde_json::Value;

use crate::{
    Error,
    config::FieldBindings,
    store::{Document, DocumentId},
};

/// Logical role of a required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Id,
    State,
    ProcessingTime,
}

impl std::fmt::Display for FieldRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FieldRole::Id => "id",
            FieldRole::State => "state",
            FieldRole::ProcessingTime => "processing time",
        })
    }
}

/// Shape a record type asks for when one of its fields is deserialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    /// Signed integer of the given width in bits.
    Signed(u8),
    /// Unsigned integer of the given width in bits.
    Unsigned(u8),
    Float,
    Char,
    Str,
    Bytes,
    Unit,
    Option(Box<FieldKind>),
    /// Newtype struct around another kind.
    Newtype(Box<FieldKind>),
    Seq,
    Map,
    Struct,
    Enum,
    /// Self-describing (`deserialize_any`); the type gave no hint.
    Any,
    Unknown,
}

impl FieldKind {
    fn unwrap_newtype(&self) -> &FieldKind {
        match self {
            FieldKind::Newtype(inner) => inner.unwrap_newtype(),
            other => other,
        }
    }

    fn is_identifier(&self) -> bool {
        matches!(
            self.unwrap_newtype(),
            FieldKind::Str | FieldKind::Signed(_) | FieldKind::Unsigned(_)
        )
    }

    fn is_state(&self) -> bool {
        matches!(self.unwrap_newtype(), FieldKind::Str)
    }

    fn is_timestamp(&self) -> bool {
        match self.unwrap_newtype() {
            FieldKind::Signed(bits) | FieldKind::Unsigned(bits) => *bits >= 64,
            FieldKind::Option(inner) => {
                !matches!(inner.unwrap_newtype(), FieldKind::Option(_)) && inner.is_timestamp()
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Bool => f.write_str("bool"),
            FieldKind::Signed(bits) => write!(f, "i{bits}"),
            FieldKind::Unsigned(bits) => write!(f, "u{bits}"),
            FieldKind::Float => f.write_str("float"),
            FieldKind::Char => f.write_str("char"),
            FieldKind::Str => f.write_str("string"),
            FieldKind::Bytes => f.write_str("bytes"),
            FieldKind::Unit => f.write_str("unit"),
            FieldKind::Option(inner) => write!(f, "option<{inner}>"),
            FieldKind::Newtype(inner) => write!(f, "newtype<{inner}>"),
            FieldKind::Seq => f.write_str("sequence"),
            FieldKind::Map => f.write_str("map"),
            FieldKind::Struct => f.write_str("struct"),
            FieldKind::Enum => f.write_str("enum"),
            FieldKind::Any => f.write_str("self-describing value"),
            FieldKind::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("record type must be a struct with named fields")]
    NotAStruct,
    #[error("{role} field `{field}` is missing from the record type")]
    MissingField { role: FieldRole, field: String },
    #[error("{role} field `{field}` is {found}, expected {expected}")]
    WrongType {
        role: FieldRole,
        field: String,
        found: FieldKind,
        expected: &'static str,
    },
}

/// A record type checked against the field bindings.
///
/// Holding one is proof that `T` exposes the id, state and processing-time
/// fields with acceptable types.
pub struct ValidatedSchema<T> {
    fields: FieldBindings,
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ValidatedSchema<T> {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
            marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ValidatedSchema<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedSchema")
            .field("record", &std::any::type_name::<T>())
            .field("fields", &self.fields)
            .finish()
    }
}

impl<T> ValidatedSchema<T>
where
    T: DeserializeOwned,
{
    /// Inspect `T` once and check the three bound fields.
    pub fn validate(fields: &FieldBindings) -> Result<Self, SchemaError> {
        let checks: [(FieldRole, &String, fn(&FieldKind) -> bool, &'static str); 3] = [
            (
                FieldRole::Id,
                &fields.id,
                FieldKind::is_identifier,
                "a string or integer",
            ),
            (FieldRole::State, &fields.state, FieldKind::is_state, "a string"),
            (
                FieldRole::ProcessingTime,
                &fields.processing_time,
                FieldKind::is_timestamp,
                "a 64-bit integer or an optional one",
            ),
        ];
        for (role, field, accept, expected) in checks {
            // One pass per field: a field that rejects its placeholder ends
            // the derived visitor, which must not hide the fields after it.
            let traced = trace::<T>(field)?;
            if !traced.declared.iter().any(|declared| *declared == field.as_str()) {
                return Err(SchemaError::MissingField {
                    role,
                    field: field.clone(),
                });
            }
            let found = traced
                .kinds
                .iter()
                .find(|(name, _)| *name == field.as_str())
                .map(|(_, kind)| kind.clone())
                .unwrap_or(FieldKind::Unknown);
            if !accept(&found) {
                return Err(SchemaError::WrongType {
                    role,
                    field: field.clone(),
                    found,
                    expected,
                });
            }
        }

        Ok(Self {
            fields: fields.clone(),
            marker: PhantomData,
        })
    }

    /// Decode one document into the record type.
    pub fn bind(&self, document: Document) -> Result<T, Error> {
        Ok(serde_json::from_value(Value::Object(document))?)
    }
}

impl<T> ValidatedSchema<T> {
    pub fn fields(&self) -> &FieldBindings {
        &self.fields
    }

    pub fn extract_id(&self, document: &Document) -> Option<DocumentId> {
        document.get(&self.fields.id).and_then(DocumentId::from_value)
    }

    pub fn extract_state<'d>(&self, document: &'d Document) -> Option<&'d str> {
        document.get(&self.fields.state).and_then(Value::as_str)
    }

    pub fn set_state(&self, document: &mut Document, state: &str) {
        document.insert(self.fields.state.clone(), Value::from(state));
    }

    /// `millis` is milliseconds since the Unix epoch; `0` clears the lease.
    pub fn set_processing_time(&self, document: &mut Document, millis: i64) {
        document.insert(self.fields.processing_time.clone(), Value::from(millis));
    }
}

/// Result of probing a record type.
#[derive(Debug)]
struct Traced {
    /// Every field name the type declares.
    declared: &'static [&'static str],
    /// Kinds recorded for the offered field, if the type declares it.
    kinds: Vec<(&'static str, FieldKind)>,
}

fn trace<T>(wanted: &str) -> Result<Traced, SchemaError>
where
    T: DeserializeOwned,
{
    let mut traced = None;
    // The tracer feeds placeholder values, so the final result is usually an
    // error ("missing field", rejected placeholder). Only the recorded
    // kinds matter.
    let _ = T::deserialize(StructTracer {
        wanted,
        out: &mut traced,
    });
    traced.ok_or(SchemaError::NotAStruct)
}

struct StructTracer<'a> {
    wanted: &'a str,
    out: &'a mut Option<Traced>,
}

impl<'de> Deserializer<'de> for StructTracer<'_> {
    type Error = TraceError;

    fn deserialize_any<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        Err(de::Error::custom("record type is not a struct"))
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        let keys = fields
            .iter()
            .copied()
            .filter(|field| *field == self.wanted)
            .collect::<Vec<_>>();
        let traced = self.out.insert(Traced {
            declared: fields,
            kinds: Vec::new(),
        });
        visitor.visit_map(TraceMap {
            keys: keys.into_iter(),
            current: None,
            kinds: &mut traced.kinds,
        })
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map enum identifier ignored_any
    }
}

/// Offers the wanted field name as the only key.
struct TraceMap<'a> {
    keys: std::vec::IntoIter<&'static str>,
    current: Option<&'static str>,
    kinds: &'a mut Vec<(&'static str, FieldKind)>,
}

impl<'de> MapAccess<'de> for TraceMap<'_> {
    type Error = TraceError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: DeserializeSeed<'de>,
    {
        let Some(key) = self.keys.next() else {
            return Ok(None);
        };
        self.current = Some(key);
        seed.deserialize(StrDeserializer::<TraceError>::new(key))
            .map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: DeserializeSeed<'de>,
    {
        let mut kind = None;
        let result = seed.deserialize(ValueTracer { kind: &mut kind });
        if let Some(field) = self.current.take() {
            self.kinds
                .push((field, kind.unwrap_or(FieldKind::Unknown)));
        }
        result
    }
}

/// Records the first type hint it receives and answers with a placeholder.
struct ValueTracer<'a> {
    kind: &'a mut Option<FieldKind>,
}

macro_rules! trace_scalar {
    ($($method:ident => $kind:expr, $visit:ident($($value:expr)?);)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, Self::Error>
            where
                V: Visitor<'de>,
            {
                *self.kind = Some($kind);
                visitor.$visit($($value)?)
            }
        )*
    };
}

macro_rules! trace_opaque {
    ($($method:ident => $kind:expr;)*) => {
        $(
            fn $method<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
            where
                V: Visitor<'de>,
            {
                *self.kind = Some($kind);
                Err(de::Error::custom("composite values are not traced"))
            }
        )*
    };
}

impl<'de> Deserializer<'de> for ValueTracer<'_> {
    type Error = TraceError;

    trace_scalar! {
        deserialize_any => FieldKind::Any, visit_unit();
        deserialize_bool => FieldKind::Bool, visit_bool(false);
        deserialize_i8 => FieldKind::Signed(8), visit_i8(0);
        deserialize_i16 => FieldKind::Signed(16), visit_i16(0);
        deserialize_i32 => FieldKind::Signed(32), visit_i32(0);
        deserialize_i64 => FieldKind::Signed(64), visit_i64(0);
        deserialize_i128 => FieldKind::Signed(128), visit_i128(0);
        deserialize_u8 => FieldKind::Unsigned(8), visit_u8(0);
        deserialize_u16 => FieldKind::Unsigned(16), visit_u16(0);
        deserialize_u32 => FieldKind::Unsigned(32), visit_u32(0);
        deserialize_u64 => FieldKind::Unsigned(64), visit_u64(0);
        deserialize_u128 => FieldKind::Unsigned(128), visit_u128(0);
        deserialize_f32 => FieldKind::Float, visit_f32(0.0);
        deserialize_f64 => FieldKind::Float, visit_f64(0.0);
        deserialize_char => FieldKind::Char, visit_char('\0');
        deserialize_str => FieldKind::Str, visit_str("");
        deserialize_string => FieldKind::Str, visit_string(String::new());
        deserialize_identifier => FieldKind::Str, visit_str("");
        deserialize_bytes => FieldKind::Bytes, visit_bytes(&[]);
        deserialize_byte_buf => FieldKind::Bytes, visit_byte_buf(Vec::new());
        deserialize_unit => FieldKind::Unit, visit_unit();
        deserialize_ignored_any => FieldKind::Unknown, visit_unit();
    }

    trace_opaque! {
        deserialize_seq => FieldKind::Seq;
        deserialize_map => FieldKind::Map;
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        let mut inner = None;
        let result = visitor.visit_some(ValueTracer { kind: &mut inner });
        *self.kind = Some(FieldKind::Option(Box::new(
            inner.unwrap_or(FieldKind::Unknown),
        )));
        result
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        let mut inner = None;
        let result = visitor.visit_newtype_struct(ValueTracer { kind: &mut inner });
        *self.kind = Some(FieldKind::Newtype(Box::new(
            inner.unwrap_or(FieldKind::Unknown),
        )));
        result
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        *self.kind = Some(FieldKind::Unit);
        visitor.visit_unit()
    }

    fn deserialize_tuple<V>(self, _len: usize, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        *self.kind = Some(FieldKind::Seq);
        Err(de::Error::custom("composite values are not traced"))
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        _len: usize,
        _visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        *self.kind = Some(FieldKind::Seq);
        Err(de::Error::custom("composite values are not traced"))
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        *self.kind = Some(FieldKind::Struct);
        Err(de::Error::custom("composite values are not traced"))
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        *self.kind = Some(FieldKind::Enum);
        Err(de::Error::custom("composite values are not traced"))
    }
}
