//! Two-phase commit transaction identifiers.
//!
//! An [`Xid`] either carries the full XA triple (format id, global
//! transaction id, branch qualifier) or wraps an opaque string. XA triples
//! are rendered as `{format_id}_{b64(gtrid)}_{b64(bqual)}`; since standard
//! base64 never contains an underscore the rendering parses back
//! unambiguously. Anything that does not parse as a triple round-trips as
//! an opaque identifier, so `PREPARE TRANSACTION` names created by other
//! tools can still be recovered and finished.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};

const XA_PART_MAX: usize = 64;

/// A distributed transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    /// XA format id; `None` for opaque identifiers.
    format_id: Option<i32>,
    gtrid: String,
    bqual: Option<String>,
}

impl Xid {
    /// Build a full XA triple.
    pub fn new(format_id: i32, gtrid: impl Into<String>, bqual: impl Into<String>) -> Result<Self> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if !(0..=0x7fff_ffff).contains(&format_id) {
            return Err(Error::Programming(format!(
                "format_id must be non-negative, got {format_id}"
            )));
        }
        for (name, part) in [("gtrid", &gtrid), ("bqual", &bqual)] {
            if part.len() > XA_PART_MAX {
                return Err(Error::Programming(format!(
                    "{name} must be at most {XA_PART_MAX} bytes, got {}",
                    part.len()
                )));
            }
        }
        Ok(Self {
            format_id: Some(format_id),
            gtrid,
            bqual: Some(bqual),
        })
    }

    /// Wrap an opaque transaction identifier.
    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            format_id: None,
            gtrid: value.into(),
            bqual: None,
        }
    }

    /// Interpret a recovered `PREPARE TRANSACTION` name.
    ///
    /// Never fails: a string that is not an XA rendering is kept opaque.
    pub fn parse(value: &str) -> Self {
        Self::try_parse_triple(value).unwrap_or_else(|| Self::from_string(value))
    }

    fn try_parse_triple(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, '_');
        let format_id: i32 = parts.next()?.parse().ok()?;
        if format_id < 0 {
            return None;
        }
        let gtrid = BASE64.decode(parts.next()?).ok()?;
        let bqual = BASE64.decode(parts.next()?).ok()?;
        Some(Self {
            format_id: Some(format_id),
            gtrid: String::from_utf8(gtrid).ok()?,
            bqual: Some(String::from_utf8(bqual).ok()?),
        })
    }

    pub fn format_id(&self) -> Option<i32> {
        self.format_id
    }

    pub fn gtrid(&self) -> &str {
        &self.gtrid
    }

    pub fn bqual(&self) -> Option<&str> {
        self.bqual.as_deref()
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format_id {
            Some(format_id) => write!(
                f,
                "{}_{}_{}",
                format_id,
                BASE64.encode(&self.gtrid),
                BASE64.encode(self.bqual.as_deref().unwrap_or("")),
            ),
            None => f.write_str(&self.gtrid),
        }
    }
}

/// A transaction recovered from `pg_prepared_xacts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransaction {
    pub xid: Xid,
    pub prepared: String,
    pub owner: String,
    pub database: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_roundtrips_through_text() {
        let xid = Xid::new(42, "global/tx", "branch:1").unwrap();
        let text = xid.to_string();
        assert_eq!(Xid::parse(&text), xid);
    }

    #[test]
    fn underscores_in_parts_do_not_confuse_parsing() {
        let xid = Xid::new(0, "a_b_c", "d_e").unwrap();
        let parsed = Xid::parse(&xid.to_string());
        assert_eq!(parsed.gtrid(), "a_b_c");
        assert_eq!(parsed.bqual(), Some("d_e"));
    }

    #[test]
    fn foreign_names_stay_opaque() {
        let xid = Xid::parse("manually prepared elsewhere");
        assert_eq!(xid.format_id(), None);
        assert_eq!(xid.gtrid(), "manually prepared elsewhere");
        assert_eq!(xid.to_string(), "manually prepared elsewhere");
    }

    #[test]
    fn almost_triples_stay_opaque() {
        // Right shape, but the middle part is not base64.
        let xid = Xid::parse("7_not!base64_Zm9v");
        assert_eq!(xid.format_id(), None);
    }

    #[test]
    fn oversized_parts_are_rejected() {
        let long = "x".repeat(65);
        assert!(Xid::new(1, long.clone(), "b").is_err());
        assert!(Xid::new(1, "a", long).is_err());
        assert!(Xid::new(-1, "a", "b").is_err());
    }
}
