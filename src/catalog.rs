//! Product catalog backing the demo endpoints.
//!
//! The server ships with a small built-in catalog so it works out of the
//! box; a JSON file (a bare array of products) can replace it at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: u64,
    pub name: String,
    pub price: f64,
    pub category: String,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    products: Vec<Product>,
}

impl Catalog {
    /// The stock demo catalog.
    pub fn builtin() -> Self {
        let entry = |id, name: &str, price, category: &str| Product {
            id,
            name: name.to_string(),
            price,
            category: category.to_string(),
        };
        Self {
            products: vec![
                entry(1, "Laptop", 999.99, "electronics"),
                entry(2, "Smartphone", 699.99, "electronics"),
                entry(3, "Headphones", 199.99, "accessories"),
                entry(4, "Monitor", 349.99, "electronics"),
                entry(5, "Keyboard", 129.99, "accessories"),
            ],
        }
    }

    /// Load a catalog from a JSON file holding a bare array of products.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        let products: Vec<Product> = serde_json::from_str(&raw)?;
        Ok(Self { products })
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn get(&self, id: u64) -> Option<&Product> {
        self.products.iter().find(|p| p.id == id)
    }

    /// The whole catalog as a JSON array.
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&self.products)?)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}
