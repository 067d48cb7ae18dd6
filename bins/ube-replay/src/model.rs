//! Demo catalogue entities replayed by the binary.

use serde::{Deserialize, Serialize};
use ube_api::{Entity, Error, Key};
use ube_engine::action::SubEntityField;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sku: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<Store>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Store {
    pub id: String,
    #[serde(default)]
    pub city: String,
}

impl Entity for Product {
    fn key(&self) -> Key {
        if self.sku.is_empty() {
            Key::new(self.id.clone())
        } else {
            Key::with_sk(self.id.clone(), self.sku.clone())
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() {
            return Err(Error::validation("product id is required"));
        }
        if self.price_cents < 0 {
            return Err(Error::validation(format!("product '{}' has a negative price", self.id)));
        }
        Ok(())
    }
}

impl Entity for Store {
    fn key(&self) -> Key {
        Key::new(self.id.clone())
    }
}

/// The store a product is stocked in.
pub fn store_field() -> SubEntityField<Product, Store> {
    SubEntityField {
        name: "store",
        key: |p| p.store_id.clone().map(Key::new),
        set: |p, s| p.store = Some(s),
    }
}
