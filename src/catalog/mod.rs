pub mod client;
pub mod config;

use crate::models::{AttributeDefinition, AttributeType};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use client::HttpCatalogClient;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("category `{0}` not found in catalog")]
    NotFound(String),
    #[error("catalog request failed: {0}")]
    Request(String),
}

/// Read-only lookup of the attribute definitions for a category.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn lookup(&self, category_id: &str) -> Result<Vec<AttributeDefinition>, CatalogError>;
}

/// Picks the HTTP catalog when `CATALOG_URL` is set, the demo catalog otherwise.
pub fn from_env() -> Arc<dyn CatalogClient> {
    match config::CATALOG_ROOT.as_ref() {
        Some(root) => {
            info!(target = "cardforge.catalog", root = %root, "using remote catalog");
            Arc::new(HttpCatalogClient::new(
                root.clone(),
                config::CATALOG_API_KEY.clone(),
            ))
        }
        None => {
            info!(target = "cardforge.catalog", "CATALOG_URL not set; using demo catalog");
            Arc::new(DemoCatalog)
        }
    }
}

#[derive(Clone, Copy)]
struct DemoAttribute {
    id: i64,
    name: &'static str,
    kind: AttributeType,
    required: bool,
    allowed: &'static [&'static str],
}

#[derive(Clone, Copy)]
struct DemoCategory {
    id: &'static str,
    attributes: &'static [DemoAttribute],
}

const fn text(id: i64, name: &'static str, required: bool) -> DemoAttribute {
    DemoAttribute {
        id,
        name,
        kind: AttributeType::String,
        required,
        allowed: &[],
    }
}

const fn number(id: i64, name: &'static str) -> DemoAttribute {
    DemoAttribute {
        id,
        name,
        kind: AttributeType::Number,
        required: false,
        allowed: &[],
    }
}

const DEMO_CATEGORIES: [DemoCategory; 2] = [
    DemoCategory {
        id: "watches",
        attributes: &[
            text(85, "Бренд", true),
            DemoAttribute {
                id: 10096,
                name: "Цвет товара",
                kind: AttributeType::String,
                required: true,
                allowed: &["черный", "серебристый", "золотистый", "белый"],
            },
            text(4496, "Материал корпуса", false),
            text(4497, "Материал ремешка", false),
            number(4501, "Диаметр корпуса, мм"),
            number(4383, "Вес товара, г"),
            text(9048, "Тип механизма", false),
            number(4502, "Водонепроницаемость, м"),
        ],
    },
    DemoCategory {
        id: "kettles",
        attributes: &[
            text(85, "Бренд", true),
            text(10096, "Цвет товара", true),
            number(5101, "Объем, л"),
            number(5102, "Мощность, Вт"),
            text(5103, "Материал корпуса", false),
            DemoAttribute {
                id: 5104,
                name: "Тип нагревательного элемента",
                kind: AttributeType::String,
                required: false,
                allowed: &["открытый", "закрытый"],
            },
        ],
    },
];

/// Definitions of a built-in category, matched case-insensitively.
pub fn demo_definitions(category_id: &str) -> Option<Vec<AttributeDefinition>> {
    let category = DEMO_CATEGORIES
        .iter()
        .find(|c| c.id.eq_ignore_ascii_case(category_id.trim()))?;
    Some(
        category
            .attributes
            .iter()
            .map(|attr| AttributeDefinition {
                id: attr.id,
                name: attr.name.to_string(),
                kind: attr.kind,
                required: attr.required,
                allowed_values: attr.allowed.iter().map(|v| v.to_string()).collect(),
            })
            .collect(),
    )
}

/// Built-in catalog for local runs without a catalog service.
pub struct DemoCatalog;

#[async_trait]
impl CatalogClient for DemoCatalog {
    async fn lookup(&self, category_id: &str) -> Result<Vec<AttributeDefinition>, CatalogError> {
        demo_definitions(category_id).ok_or_else(|| CatalogError::NotFound(category_id.to_string()))
    }
}
