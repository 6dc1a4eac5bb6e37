use super::{CatalogClient, CatalogError};
use crate::http::{build_client, describe_failure};
use crate::models::AttributeDefinition;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use urlencoding::encode;

/// Reads attribute definitions from `{root}/categories/{id}/attributes`.
pub struct HttpCatalogClient {
    http: Client,
    root: String,
    api_key: Option<String>,
}

impl HttpCatalogClient {
    pub fn new(root: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: build_client(),
            root: root.into(),
            api_key,
        }
    }

    fn url_for(&self, category_id: &str) -> String {
        format!(
            "{}/categories/{}/attributes",
            self.root.trim_end_matches('/'),
            encode(category_id.trim())
        )
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn lookup(&self, category_id: &str) -> Result<Vec<AttributeDefinition>, CatalogError> {
        let mut request = self.http.get(self.url_for(category_id));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(category_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(CatalogError::Request(describe_failure(response).await));
        }

        response
            .json::<Vec<AttributeDefinition>>()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_id_is_path_encoded() {
        let client = HttpCatalogClient::new("https://catalog.example.com/", None);
        assert_eq!(
            client.url_for("17028922/одежда"),
            "https://catalog.example.com/categories/17028922%2F%D0%BE%D0%B4%D0%B5%D0%B6%D0%B4%D0%B0/attributes"
        );
    }
}
