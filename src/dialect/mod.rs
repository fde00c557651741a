//! Dialect Resolution
//!
//! Maps a connection URI scheme to a closed `Dialect` tag and owns the
//! per-dialect rules: accepted scheme aliases, explicit driver rewrite and
//! default network port.
//!
//! # Lookup Table
//! All dialect knowledge lives in `DIALECTS`. Adding a dialect is one
//! table entry plus an engine module; nothing else matches on scheme text.
//!
//! # Scheme Rules
//! - Detection uses the text before `://`, case-insensitive
//! - A `+driver` suffix is ignored for detection (`mysql+pymysql` is `mysql`)
//! - Normalization only touches URIs whose scheme has no explicit driver

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QueryGateError, Result};

/// Supported SQL dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `PostgreSQL`
    Postgresql,
    /// `MySQL` (includes `MariaDB`)
    Mysql,
    /// `SQLite` database file
    Sqlite,
    /// CSV file or directory of CSV files, queried through in-memory `SQLite`
    Csv,
}

/// Static per-dialect rules
#[derive(Debug, Clone, Copy)]
pub struct DialectRules {
    pub dialect: Dialect,
    /// Accepted scheme names (first entry is canonical)
    pub schemes: &'static [&'static str],
    /// Driver named explicitly when a bare scheme is normalized
    pub explicit_driver: Option<&'static str>,
    /// Network port applied at connection-build time when the URI has none
    pub default_port: Option<u16>,
    /// Whether the URI addresses a local file rather than a server
    pub file_backed: bool,
}

const DIALECTS: &[DialectRules] = &[
    DialectRules {
        dialect: Dialect::Postgresql,
        schemes: &["postgresql", "postgres"],
        explicit_driver: None,
        default_port: Some(5432),
        file_backed: false,
    },
    DialectRules {
        dialect: Dialect::Mysql,
        schemes: &["mysql", "mariadb"],
        explicit_driver: Some("pymysql"),
        default_port: Some(3306),
        file_backed: false,
    },
    DialectRules {
        dialect: Dialect::Sqlite,
        schemes: &["sqlite"],
        explicit_driver: None,
        default_port: None,
        file_backed: true,
    },
    DialectRules {
        dialect: Dialect::Csv,
        schemes: &["csv"],
        explicit_driver: None,
        default_port: None,
        file_backed: true,
    },
];

impl Dialect {
    /// All dialects, in table order
    pub fn all() -> impl Iterator<Item = Self> {
        DIALECTS.iter().map(|rules| rules.dialect)
    }

    /// Stable lowercase tag, persisted and displayed by callers
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
            Self::Csv => "csv",
        }
    }

    /// Table entry for this dialect
    #[must_use]
    pub fn rules(&self) -> &'static DialectRules {
        DIALECTS
            .iter()
            .find(|rules| rules.dialect == *self)
            .unwrap_or(&DIALECTS[0])
    }

    #[must_use]
    pub fn default_port(&self) -> Option<u16> {
        self.rules().default_port
    }

    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.rules().file_backed
    }

    /// Look up a dialect by scheme name (no `+driver` suffix), case-insensitive
    #[must_use]
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        let scheme = scheme.to_ascii_lowercase();
        DIALECTS
            .iter()
            .find(|rules| rules.schemes.contains(&scheme.as_str()))
            .map(|rules| rules.dialect)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = QueryGateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_scheme(s).ok_or_else(|| QueryGateError::unsupported_dialect(s))
    }
}

/// Split a URI into its scheme segment (text before `://`) and the remainder
pub(crate) fn split_scheme(uri: &str) -> Result<(&str, &str)> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| QueryGateError::malformed_uri("missing '://' scheme separator"))?;

    if scheme.is_empty() {
        return Err(QueryGateError::malformed_uri("empty scheme"));
    }

    Ok((scheme, rest))
}

/// Derive the dialect of a connection URI from its scheme prefix
pub fn dialect_of(uri: &str) -> Result<Dialect> {
    let (scheme, _) = split_scheme(uri)?;
    let base = scheme.split('+').next().unwrap_or(scheme);

    Dialect::from_scheme(base).ok_or_else(|| QueryGateError::unsupported_dialect(scheme))
}

/// Rewrite a bare scheme to name the dialect's explicit driver
///
/// `mysql://a:b@h:3306/db` becomes `mysql+pymysql://a:b@h:3306/db`. URIs that
/// already name a driver, and dialects without an explicit driver rule, are
/// returned unchanged, so applying this twice equals applying it once.
pub fn normalize_driver(uri: &str) -> Result<String> {
    let dialect = dialect_of(uri)?;
    let (scheme, rest) = split_scheme(uri)?;

    if scheme.contains('+') {
        return Ok(uri.to_string());
    }

    match dialect.rules().explicit_driver {
        Some(driver) => Ok(format!("{scheme}+{driver}://{rest}")),
        None => Ok(uri.to_string()),
    }
}
