//! # Oracle Payload Decoding
//!
//! The `data` field of an `OracleRequest` log is a CBOR *sequence*: key and value items written
//! one after another with no enclosing map, the way a Chainlink request buffer is built. Decoding
//! happens in three steps:
//!
//! 1. [`decode_terms`] reads every item into a [`Term`].
//! 2. [`pair_terms`] folds the items pairwise into a key → value map.
//! 3. [`decode_order_request`] validates the map into an [`OrderRequest`].
//!
//! Every failure is a [`DecodeError`] and no partial record is ever produced.

use std::collections::BTreeMap;
use std::convert::Infallible;

use minicbor::data::{Tag, Type};
use minicbor::{Decoder, Encoder};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::order::OrderRequest;

/// Nesting limit for arrays inside a payload.
const MAX_DEPTH: usize = 16;

/// CBOR tag of a positive bignum.
const POSITIVE_BIGNUM_TAG: u64 = 2;

/// CBOR tag of a negative bignum.
const NEGATIVE_BIGNUM_TAG: u64 = 3;

/// One decoded CBOR item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// A text string.
    Text(String),
    /// A byte string.
    Bytes(Vec<u8>),
    /// Any integer, including bignums that fit in 128 bits.
    Integer(i128),
    /// A boolean.
    Bool(bool),
    /// `null` or `undefined`.
    Null,
    /// An array of items.
    Array(Vec<Term>),
}

impl Term {
    /// Short name of the item kind, used in error messages.
    fn kind(&self) -> &'static str {
        match self {
            Term::Text(_) => "text",
            Term::Bytes(_) => "bytes",
            Term::Integer(_) => "integer",
            Term::Bool(_) => "bool",
            Term::Null => "null",
            Term::Array(_) => "array",
        }
    }
}

/// Errors produced while decoding an oracle payload.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    /// The bytes are not valid CBOR.
    #[snafu(display("Malformed CBOR payload: {source}"))]
    Cbor {
        /// The underlying decoder error.
        source: minicbor::decode::Error,
    },

    /// The payload contains an item kind that requests never carry.
    #[snafu(display("Unsupported CBOR item of type {kind}"))]
    UnsupportedItem {
        /// Debug name of the CBOR type.
        kind: String,
    },

    /// The payload contains a tag other than a bignum.
    #[snafu(display("Unsupported CBOR tag {tag}"))]
    UnsupportedTag {
        /// The tag number.
        tag: u64,
    },

    /// A bignum does not fit in 128 bits.
    #[snafu(display("Bignum of {len} bytes does not fit in 128 bits"))]
    IntegerOverflow {
        /// Byte length of the bignum.
        len: usize,
    },

    /// Arrays are nested deeper than allowed.
    #[snafu(display("CBOR items nested deeper than {max}"))]
    NestingTooDeep {
        /// The nesting limit.
        max: usize,
    },

    /// Items cannot be paired into keys and values.
    #[snafu(display("Expected an even number of key/value items, got {count}"))]
    OddTermCount {
        /// Number of decoded items.
        count: usize,
    },

    /// A key position holds something other than text.
    #[snafu(display("Key at position {index} is {kind}, expected text"))]
    NonTextKey {
        /// Position of the offending item in the sequence.
        index: usize,
        /// Kind of the offending item.
        kind: &'static str,
    },

    /// A required field is absent.
    #[snafu(display("Missing required field `{field}`"))]
    MissingField {
        /// Name of the field.
        field: &'static str,
    },

    /// A required field has the wrong type or an out of range value.
    #[snafu(display("Invalid field `{field}`: {reason}"))]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A hex encoded payload could not be parsed.
    #[snafu(display("Payload is not valid hex: {source}"))]
    Hex {
        /// The hex error.
        source: hex::FromHexError,
    },
}

/// Decodes every item of a CBOR sequence.
pub fn decode_terms(bytes: &[u8]) -> Result<Vec<Term>, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let mut terms = Vec::new();
    while dec.position() < bytes.len() {
        terms.push(decode_term(&mut dec, 0)?);
    }
    Ok(terms)
}

/// Decodes the item at the decoder's position.
fn decode_term(dec: &mut Decoder, depth: usize) -> Result<Term, DecodeError> {
    ensure!(depth <= MAX_DEPTH, NestingTooDeepSnafu { max: MAX_DEPTH });

    let ty = dec.datatype().context(CborSnafu)?;
    let term = match ty {
        Type::String => Term::Text(dec.str().context(CborSnafu)?.to_string()),
        Type::StringIndef => {
            let mut text = String::new();
            for chunk in dec.str_iter().context(CborSnafu)? {
                text.push_str(chunk.context(CborSnafu)?);
            }
            Term::Text(text)
        }
        Type::Bytes => Term::Bytes(dec.bytes().context(CborSnafu)?.to_vec()),
        Type::BytesIndef => {
            let mut bytes = Vec::new();
            for chunk in dec.bytes_iter().context(CborSnafu)? {
                bytes.extend_from_slice(chunk.context(CborSnafu)?);
            }
            Term::Bytes(bytes)
        }
        Type::U8
        | Type::U16
        | Type::U32
        | Type::U64
        | Type::I8
        | Type::I16
        | Type::I32
        | Type::I64
        | Type::Int => Term::Integer(i128::from(dec.int().context(CborSnafu)?)),
        Type::Bool => Term::Bool(dec.bool().context(CborSnafu)?),
        Type::Null => {
            dec.null().context(CborSnafu)?;
            Term::Null
        }
        Type::Undefined => {
            dec.undefined().context(CborSnafu)?;
            Term::Null
        }
        Type::Tag => decode_bignum(dec)?,
        Type::Array => {
            let len = dec.array().context(CborSnafu)?.unwrap_or_default();
            let mut items = Vec::new();
            for _ in 0..len {
                items.push(decode_term(dec, depth + 1)?);
            }
            Term::Array(items)
        }
        Type::ArrayIndef => {
            dec.array().context(CborSnafu)?;
            let mut items = Vec::new();
            loop {
                if dec.datatype().context(CborSnafu)? == Type::Break {
                    // break marker is a single byte
                    dec.set_position(dec.position() + 1);
                    break;
                }
                items.push(decode_term(dec, depth + 1)?);
            }
            Term::Array(items)
        }
        other => {
            return UnsupportedItemSnafu {
                kind: format!("{other:?}"),
            }
            .fail()
        }
    };
    Ok(term)
}

/// Decodes a tag 2 / tag 3 bignum into an integer.
fn decode_bignum(dec: &mut Decoder) -> Result<Term, DecodeError> {
    let tag = dec.tag().context(CborSnafu)?.as_u64();
    ensure!(
        tag == POSITIVE_BIGNUM_TAG || tag == NEGATIVE_BIGNUM_TAG,
        UnsupportedTagSnafu { tag }
    );

    let raw = dec.bytes().context(CborSnafu)?;
    let significant = match raw.iter().position(|byte| *byte != 0) {
        Some(start) => &raw[start..],
        None => &[][..],
    };
    ensure!(
        significant.len() <= 16,
        IntegerOverflowSnafu { len: raw.len() }
    );

    let magnitude = significant
        .iter()
        .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte));
    let magnitude =
        i128::try_from(magnitude).map_err(|_| IntegerOverflowSnafu { len: raw.len() }.build())?;

    Ok(Term::Integer(if tag == POSITIVE_BIGNUM_TAG {
        magnitude
    } else {
        -1 - magnitude
    }))
}

/// Encodes items as a CBOR sequence, the inverse of [`decode_terms`].
pub fn encode_terms(terms: &[Term]) -> Result<Vec<u8>, minicbor::encode::Error<Infallible>> {
    let mut enc = Encoder::new(Vec::new());
    for term in terms {
        encode_term(&mut enc, term)?;
    }
    Ok(enc.into_writer())
}

/// Writes one item.
fn encode_term(
    enc: &mut Encoder<Vec<u8>>,
    term: &Term,
) -> Result<(), minicbor::encode::Error<Infallible>> {
    match term {
        Term::Text(text) => {
            enc.str(text)?;
        }
        Term::Bytes(bytes) => {
            enc.bytes(bytes)?;
        }
        Term::Integer(value) => match minicbor::data::Int::try_from(*value) {
            Ok(int) => {
                enc.int(int)?;
            }
            Err(_) => {
                let (tag, magnitude) = if *value >= 0 {
                    (POSITIVE_BIGNUM_TAG, value.unsigned_abs())
                } else {
                    (NEGATIVE_BIGNUM_TAG, (-1 - value).unsigned_abs())
                };
                let bytes = magnitude.to_be_bytes();
                let start = bytes.iter().position(|byte| *byte != 0).unwrap_or(15);
                enc.tag(Tag::new(tag))?.bytes(&bytes[start..])?;
            }
        },
        Term::Bool(value) => {
            enc.bool(*value)?;
        }
        Term::Null => {
            enc.null()?;
        }
        Term::Array(items) => {
            enc.array(items.len() as u64)?;
            for item in items {
                encode_term(enc, item)?;
            }
        }
    }
    Ok(())
}

/// Pairs items as `(key, value)`. Later duplicates of a key win.
pub fn pair_terms(terms: Vec<Term>) -> Result<BTreeMap<String, Term>, DecodeError> {
    ensure!(
        terms.len() % 2 == 0,
        OddTermCountSnafu { count: terms.len() }
    );

    let mut map = BTreeMap::new();
    let mut items = terms.into_iter().enumerate();
    while let Some((index, key)) = items.next() {
        let key = match key {
            Term::Text(key) => key,
            other => {
                return NonTextKeySnafu {
                    index,
                    kind: other.kind(),
                }
                .fail()
            }
        };
        // length is even, so every key has a value
        if let Some((_, value)) = items.next() {
            map.insert(key, value);
        }
    }
    Ok(map)
}

/// Decodes an `OracleRequest` payload into an order request.
pub fn decode_order_request(payload: &[u8]) -> Result<OrderRequest, DecodeError> {
    let fields = pair_terms(decode_terms(payload)?)?;
    OrderRequest::try_from(fields)
}

/// Parses a `0x`-prefixed (or bare) hex string into payload bytes.
pub fn decode_hex_payload(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = payload.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(digits).context(HexSnafu)
}

impl TryFrom<BTreeMap<String, Term>> for OrderRequest {
    type Error = DecodeError;

    fn try_from(mut fields: BTreeMap<String, Term>) -> Result<Self, Self::Error> {
        Ok(OrderRequest {
            address: take_text(&mut fields, "address")?,
            requestor: take_text(&mut fields, "requestor")?,
            token_id: take_u64(&mut fields, "token_id")?,
            recipe_id: take_u64(&mut fields, "recipe_id")?,
        })
    }
}

/// Removes a required text field.
fn take_text(
    fields: &mut BTreeMap<String, Term>,
    field: &'static str,
) -> Result<String, DecodeError> {
    match fields.remove(field).context(MissingFieldSnafu { field })? {
        Term::Text(text) => Ok(text),
        other => InvalidFieldSnafu {
            field,
            reason: format!("expected text, got {}", other.kind()),
        }
        .fail(),
    }
}

/// Removes a required unsigned integer field.
fn take_u64(fields: &mut BTreeMap<String, Term>, field: &'static str) -> Result<u64, DecodeError> {
    match fields.remove(field).context(MissingFieldSnafu { field })? {
        Term::Integer(value) => u64::try_from(value).map_err(|_| {
            InvalidFieldSnafu {
                field,
                reason: format!("value {value} out of range for u64"),
            }
            .build()
        }),
        other => InvalidFieldSnafu {
            field,
            reason: format!("expected integer, got {}", other.kind()),
        }
        .fail(),
    }
}
