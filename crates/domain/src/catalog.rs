//! Product catalog lookups used to price order lines.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::ProductId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::order::Money;

/// Catalog data captured into an order line snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub name: String,
    pub price: Money,
    pub description: Option<String>,
}

impl ProductInfo {
    pub fn new(name: impl Into<String>, price: Money) -> Self {
        Self {
            name: name.into(),
            price,
            description: None,
        }
    }
}

/// Errors from catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of product catalog data.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the product, or `None` if the id is unknown.
    async fn get_product(&self, product_id: &ProductId) -> Result<Option<ProductInfo>, CatalogError>;
}

/// In-memory catalog for tests and single-node deployments.
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    products: Arc<RwLock<HashMap<ProductId, ProductInfo>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a product.
    pub async fn add_product(&self, product_id: impl Into<ProductId>, info: ProductInfo) {
        self.products.write().await.insert(product_id.into(), info);
    }

    /// Changes a product's current price. Placed orders keep their snapshot.
    pub async fn set_price(&self, product_id: &ProductId, price: Money) {
        if let Some(info) = self.products.write().await.get_mut(product_id) {
            info.price = price;
        }
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_product(&self, product_id: &ProductId) -> Result<Option<ProductInfo>, CatalogError> {
        Ok(self.products.read().await.get(product_id).cloned())
    }
}
