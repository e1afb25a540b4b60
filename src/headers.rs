// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Headers and Header Matching
//!
//! This module defines the header values carried on an envelope and the
//! header matcher used by headers-exchange bindings. The matcher is the only
//! component allowed to write the reserved `x-match` key.

use crate::errors::AmqpError;
use lapin::types::{
    AMQPValue, ByteArray, DecimalValue, FieldArray, FieldTable, LongLongInt, LongString,
    ShortString,
};
use std::collections::BTreeMap;

/// Reserved header key selecting the match mode of a headers binding
pub const AMQP_HEADERS_X_MATCH: &str = "x-match";

/// Header map carried by an envelope. Ordering carries no meaning.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A scalar or structured header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Raw bytes, including long strings that are not valid UTF-8
    Bytes(Vec<u8>),
    /// Fixed point number worth `value / 10^scale`
    Decimal { scale: u8, value: u32 },
    Array(Vec<HeaderValue>),
    Table(BTreeMap<String, HeaderValue>),
    Void,
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value.into())
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl HeaderValue {
    /// Returns the string content when this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
            HeaderValue::Decimal { scale, value } => AMQPValue::DecimalValue(DecimalValue {
                scale: *scale,
                value: *value,
            }),
            HeaderValue::Array(values) => AMQPValue::FieldArray(FieldArray::from(
                values.iter().map(AMQPValue::from).collect::<Vec<_>>(),
            )),
            HeaderValue::Table(table) => AMQPValue::FieldTable(to_field_table(table)),
            HeaderValue::Void => AMQPValue::Void,
        }
    }
}

impl From<&AMQPValue> for HeaderValue {
    fn from(value: &AMQPValue) -> Self {
        match value {
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
            AMQPValue::Timestamp(v) => i64::try_from(*v)
                .map(HeaderValue::Int)
                .unwrap_or(HeaderValue::Void),
            AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
            AMQPValue::Double(v) => HeaderValue::Float(*v),
            AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
            AMQPValue::LongString(v) => match std::str::from_utf8(v.as_bytes()) {
                Ok(text) => HeaderValue::String(text.to_owned()),
                Err(_) => HeaderValue::Bytes(v.as_bytes().to_vec()),
            },
            AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
            AMQPValue::DecimalValue(v) => HeaderValue::Decimal {
                scale: v.scale,
                value: v.value,
            },
            AMQPValue::FieldArray(values) => {
                HeaderValue::Array(values.as_slice().iter().map(HeaderValue::from).collect())
            }
            AMQPValue::FieldTable(table) => HeaderValue::Table(from_field_table(table)),
            _ => HeaderValue::Void,
        }
    }
}

/// Converts envelope headers into an AMQP field table.
pub fn to_field_table(headers: &Headers) -> FieldTable {
    let btree = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), AMQPValue::from(value)))
        .collect::<BTreeMap<ShortString, AMQPValue>>();

    FieldTable::from(btree)
}

/// Converts an AMQP field table into envelope headers.
pub fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), HeaderValue::from(value)))
        .collect()
}

/// How the headers of a binding are matched against a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// Every listed header must match
    All,
    /// At least one listed header must match
    #[default]
    Any,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::All => "all",
            MatchMode::Any => "any",
        }
    }
}

/// Header criteria of a headers-exchange binding.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderSpec {
    pub(crate) headers: Headers,
    pub(crate) mode: MatchMode,
}

impl HeaderSpec {
    /// Creates a header spec, refusing a caller supplied `x-match`.
    pub fn new(headers: Headers, mode: MatchMode) -> Result<HeaderSpec, AmqpError> {
        ensure_no_reserved(&headers)?;
        Ok(HeaderSpec { headers, mode })
    }

    pub fn all(headers: Headers) -> Result<HeaderSpec, AmqpError> {
        HeaderSpec::new(headers, MatchMode::All)
    }

    pub fn any(headers: Headers) -> Result<HeaderSpec, AmqpError> {
        HeaderSpec::new(headers, MatchMode::Any)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Headers augmented with the match mode discriminator.
    pub fn match_headers(&self) -> Headers {
        build_match_headers(&self.headers, self.mode)
    }
}

/// Copies `base` and sets the reserved `x-match` key to the given mode.
///
/// Publish side and subscribe side call this identically. A publisher using
/// `All` while a subscriber binds with `Any` is legal and only changes which
/// messages reach the queue.
pub fn build_match_headers(base: &Headers, mode: MatchMode) -> Headers {
    let mut headers = base.clone();
    headers.insert(
        AMQP_HEADERS_X_MATCH.to_owned(),
        HeaderValue::String(mode.as_str().to_owned()),
    );
    headers
}

/// Fails when application headers carry the reserved `x-match` key.
pub(crate) fn ensure_no_reserved(headers: &Headers) -> Result<(), AmqpError> {
    if headers.contains_key(AMQP_HEADERS_X_MATCH) {
        return Err(AmqpError::ReservedHeader(AMQP_HEADERS_X_MATCH.to_owned()));
    }

    Ok(())
}
