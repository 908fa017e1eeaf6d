//! Value adaptation between Rust types and wire fields.
//!
//! Parameters travel as [`Param`]: the serialized bytes plus the type OID
//! and format the server should interpret them with. Result fields come
//! back through [`FromField`], driven by the column descriptor so both
//! text and binary encodings are handled.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::transport::{ColumnDescription, Format, Oid, SharedColumns};

pub mod oids {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    /// Unspecified; the server infers the type from context.
    pub const UNKNOWN: Oid = 0;
}

/// One serialized statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Serialized value; `None` is SQL NULL.
    pub value: Option<Vec<u8>>,
    /// Declared parameter type, `oids::UNKNOWN` to let the server infer.
    pub oid: Oid,
    /// Encoding of `value`.
    pub format: Format,
}

impl Param {
    pub fn null() -> Self {
        Self {
            value: None,
            oid: oids::UNKNOWN,
            format: Format::Text,
        }
    }

    pub fn text(value: impl Into<Vec<u8>>, oid: Oid) -> Self {
        Self {
            value: Some(value.into()),
            oid,
            format: Format::Text,
        }
    }

    pub fn binary(value: impl Into<Vec<u8>>, oid: Oid) -> Self {
        Self {
            value: Some(value.into()),
            oid,
            format: Format::Binary,
        }
    }
}

/// Serialize a Rust value into a statement parameter.
pub trait ToParam {
    fn to_param(&self) -> Param;
}

impl ToParam for Param {
    fn to_param(&self) -> Param {
        self.clone()
    }
}

impl ToParam for bool {
    fn to_param(&self) -> Param {
        Param::text(if *self { &b"t"[..] } else { &b"f"[..] }, oids::BOOL)
    }
}

impl ToParam for i16 {
    fn to_param(&self) -> Param {
        Param::text(self.to_string(), oids::INT2)
    }
}

impl ToParam for i32 {
    fn to_param(&self) -> Param {
        Param::text(self.to_string(), oids::INT4)
    }
}

impl ToParam for i64 {
    /// Tagged with the narrowest integer type that holds the value, so
    /// the server does not force int8 plans onto int4 columns.
    fn to_param(&self) -> Param {
        let oid = if i16::try_from(*self).is_ok() {
            oids::INT2
        } else if i32::try_from(*self).is_ok() {
            oids::INT4
        } else {
            oids::INT8
        };
        Param::text(self.to_string(), oid)
    }
}

impl ToParam for f32 {
    fn to_param(&self) -> Param {
        Param::text(format_float(f64::from(*self)), oids::FLOAT4)
    }
}

impl ToParam for f64 {
    fn to_param(&self) -> Param {
        Param::text(format_float(*self), oids::FLOAT8)
    }
}

impl ToParam for &str {
    fn to_param(&self) -> Param {
        Param::text(self.as_bytes(), oids::UNKNOWN)
    }
}

impl ToParam for String {
    fn to_param(&self) -> Param {
        self.as_str().to_param()
    }
}

impl ToParam for &[u8] {
    fn to_param(&self) -> Param {
        Param::binary(*self, oids::BYTEA)
    }
}

impl ToParam for Vec<u8> {
    fn to_param(&self) -> Param {
        self.as_slice().to_param()
    }
}

impl<T: ToParam> ToParam for Option<T> {
    fn to_param(&self) -> Param {
        match self {
            Some(value) => value.to_param(),
            None => Param::null(),
        }
    }
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".into()
    } else if value == f64::INFINITY {
        "Infinity".into()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".into()
    } else {
        value.to_string()
    }
}

/// Deserialize one result field, honoring the column's wire format.
pub trait FromField: Sized {
    fn from_field(raw: Option<&[u8]>, desc: &ColumnDescription) -> Result<Self>;
}

fn expect_value<'a>(raw: Option<&'a [u8]>, desc: &ColumnDescription) -> Result<&'a [u8]> {
    raw.ok_or_else(|| Error::Data(format!("column {:?} is null", desc.name)))
}

fn text_field<'a>(raw: &'a [u8], desc: &ColumnDescription) -> Result<&'a str> {
    simdutf8::basic::from_utf8(raw)
        .map_err(|_| Error::Data(format!("column {:?} is not valid utf-8", desc.name)))
}

fn parse_text<T: std::str::FromStr>(raw: &[u8], desc: &ColumnDescription) -> Result<T> {
    let text = text_field(raw, desc)?;
    text.trim().parse().map_err(|_| {
        Error::Data(format!(
            "cannot parse {:?} from column {:?}",
            text, desc.name
        ))
    })
}

fn fixed<const N: usize>(raw: &[u8], desc: &ColumnDescription) -> Result<[u8; N]> {
    raw.try_into().map_err(|_| {
        Error::Data(format!(
            "column {:?}: expected {N} bytes, got {}",
            desc.name,
            raw.len()
        ))
    })
}

impl FromField for String {
    fn from_field(raw: Option<&[u8]>, desc: &ColumnDescription) -> Result<Self> {
        let raw = expect_value(raw, desc)?;
        Ok(text_field(raw, desc)?.to_owned())
    }
}

impl FromField for Vec<u8> {
    fn from_field(raw: Option<&[u8]>, desc: &ColumnDescription) -> Result<Self> {
        let raw = expect_value(raw, desc)?;
        if desc.format == Format::Binary {
            return Ok(raw.to_vec());
        }
        match raw.strip_prefix(b"\\x") {
            Some(hex) => decode_hex(hex, desc),
            None => Ok(raw.to_vec()),
        }
    }
}

impl FromField for bool {
    fn from_field(raw: Option<&[u8]>, desc: &ColumnDescription) -> Result<Self> {
        let raw = expect_value(raw, desc)?;
        match (desc.format, raw) {
            (Format::Binary, [0]) | (Format::Text, b"f") => Ok(false),
            (Format::Binary, [1]) | (Format::Text, b"t") => Ok(true),
            _ => Err(Error::Data(format!(
                "column {:?} is not a boolean",
                desc.name
            ))),
        }
    }
}

macro_rules! from_field_int {
    ($ty:ty) => {
        impl FromField for $ty {
            fn from_field(raw: Option<&[u8]>, desc: &ColumnDescription) -> Result<Self> {
                let raw = expect_value(raw, desc)?;
                match desc.format {
                    Format::Text => parse_text(raw, desc),
                    Format::Binary => Ok(<$ty>::from_be_bytes(fixed(raw, desc)?)),
                }
            }
        }
    };
}

from_field_int!(i16);
from_field_int!(i32);
from_field_int!(i64);
from_field_int!(f32);
from_field_int!(f64);

impl<T: FromField> FromField for Option<T> {
    fn from_field(raw: Option<&[u8]>, desc: &ColumnDescription) -> Result<Self> {
        match raw {
            None => Ok(None),
            Some(_) => Ok(Some(T::from_field(raw, desc)?)),
        }
    }
}

fn decode_hex(hex: &[u8], desc: &ColumnDescription) -> Result<Vec<u8>> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
    if hex.len() % 2 != 0 {
        return Err(Error::Data(format!(
            "column {:?}: odd-length hex bytea",
            desc.name
        )));
    }
    hex.chunks_exact(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(Error::Data(format!(
                "column {:?}: invalid hex bytea",
                desc.name
            ))),
        })
        .collect()
}

/// One fetched row; column descriptors are shared with every sibling row.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: Vec<Option<Vec<u8>>>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw bytes of one field; `None` is SQL NULL.
    pub fn raw(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn get<T: FromField>(&self, index: usize) -> Result<T> {
        let desc = self.columns.get(index).ok_or_else(|| {
            Error::Programming(format!(
                "column index {index} out of range ({} columns)",
                self.columns.len()
            ))
        })?;
        let raw = self.values.get(index).and_then(|v| v.as_deref());
        T::from_field(raw, desc)
    }

    pub fn get_by_name<T: FromField>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::Programming(format!("no column named {name:?}")))?;
        self.get(index)
    }
}

pub(crate) fn serialize_params(params: &[&dyn ToParam]) -> Vec<Param> {
    params.iter().map(|p| p.to_param()).collect()
}

pub(crate) fn rows_from_result(
    columns: &SharedColumns,
    rows: Vec<Vec<Option<Vec<u8>>>>,
) -> Vec<Row> {
    rows.into_iter()
        .map(|values| Row::new(Arc::clone(columns), values))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_column(name: &str) -> ColumnDescription {
        ColumnDescription {
            name: name.into(),
            type_oid: oids::TEXT,
            type_modifier: -1,
            type_size: -1,
            format: Format::Text,
        }
    }

    fn binary_column(name: &str, oid: Oid) -> ColumnDescription {
        ColumnDescription {
            name: name.into(),
            type_oid: oid,
            type_modifier: -1,
            type_size: -1,
            format: Format::Binary,
        }
    }

    #[test]
    fn int_params_use_narrowest_type() {
        assert_eq!(12i64.to_param().oid, oids::INT2);
        assert_eq!(40_000i64.to_param().oid, oids::INT4);
        assert_eq!(5_000_000_000i64.to_param().oid, oids::INT8);
        assert_eq!((-5_000_000_000i64).to_param().oid, oids::INT8);
    }

    #[test]
    fn option_param_serializes_null() {
        let param = Option::<i32>::None.to_param();
        assert_eq!(param.value, None);
        let param = Some(7i32).to_param();
        assert_eq!(param.value.as_deref(), Some(&b"7"[..]));
    }

    #[test]
    fn float_params_spell_special_values() {
        assert_eq!(
            f64::INFINITY.to_param().value.as_deref(),
            Some(&b"Infinity"[..])
        );
        assert_eq!(f64::NAN.to_param().value.as_deref(), Some(&b"NaN"[..]));
    }

    #[test]
    fn text_and_binary_int_fields_decode() {
        let text = text_column("n");
        assert_eq!(i32::from_field(Some(b"42"), &text).unwrap(), 42);
        let binary = binary_column("n", oids::INT4);
        let raw = 42i32.to_be_bytes();
        assert_eq!(i32::from_field(Some(&raw), &binary).unwrap(), 42);
    }

    #[test]
    fn null_field_needs_option() {
        let col = text_column("n");
        assert!(i32::from_field(None, &col).is_err());
        assert_eq!(Option::<i32>::from_field(None, &col).unwrap(), None);
    }

    #[test]
    fn hex_bytea_decodes() {
        let col = text_column("b");
        let decoded = Vec::<u8>::from_field(Some(b"\\x00ff10"), &col).unwrap();
        assert_eq!(decoded, vec![0x00, 0xff, 0x10]);
        assert!(Vec::<u8>::from_field(Some(b"\\x0g"), &col).is_err());
    }

    #[test]
    fn row_access_by_index_and_name() {
        let columns: SharedColumns = Arc::new(vec![text_column("id"), text_column("name")]);
        let row = Row::new(
            Arc::clone(&columns),
            vec![Some(b"7".to_vec()), Some(b"seven".to_vec())],
        );
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
        assert_eq!(row.get_by_name::<String>("name").unwrap(), "seven");
        assert!(row.get::<i64>(2).is_err());
        assert!(row.get_by_name::<String>("missing").is_err());
    }
}
