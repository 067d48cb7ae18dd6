use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;

/// Separator between primary and secondary key in the string form.
pub const KEY_SEPARATOR: &str = "|";

/// Storage address of an entity: primary key plus optional secondary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub pk: String,
    pub sk: Option<String>,
}

impl Key {
    pub fn new(pk: impl Into<String>) -> Self {
        Self { pk: pk.into(), sk: None }
    }

    pub fn with_sk(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self { pk: pk.into(), sk: Some(sk.into()) }
    }
}

/// `pk` or `pk|sk`.
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sk {
            Some(sk) => write!(f, "{}{KEY_SEPARATOR}{sk}", self.pk),
            None => f.write_str(&self.pk),
        }
    }
}

/// Domain payload carried by a record.
///
/// Entities are plain serde types; the engine never inspects their fields
/// except through the key and the typed accessors handed to enrichers.
pub trait Entity: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Primary (and optional secondary) key used for storage addressing
    /// and deduplication.
    fn key(&self) -> Key;

    /// Structural validation run by Transform after decode.
    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}
