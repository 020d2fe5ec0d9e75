//! Catalog messages exchanged with the product service.

use crate::codec::JsonCodec;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: i32 = 10;
pub const DEFAULT_OFFSET: i32 = 0;

/// A product as returned by the catalog. Every field is optional so that a
/// partial record from an older producer still decodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id:          Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name:        Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price:       Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity:    Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category:    Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active:      Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at:  Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at:  Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductFindAllRequest {
    pub correlation_id: String,
    pub limit:          i32,
    pub offset:         i32,
}

impl ProductFindAllRequest {
    /// Missing or non-positive limits fall back to 10, missing or negative
    /// offsets to 0.
    pub fn new(correlation_id: impl Into<String>, limit: Option<i32>, offset: Option<i32>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            limit:          limit.filter(|limit| *limit >= 1).unwrap_or(DEFAULT_LIMIT),
            offset:         offset.filter(|offset| *offset >= 0).unwrap_or(DEFAULT_OFFSET),
        }
    }
}

pub type ProductList = Vec<ProductResponse>;

pub type ProductListCodec = JsonCodec<ProductList>;
