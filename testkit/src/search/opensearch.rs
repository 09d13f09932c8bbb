//! The OpenSearch client.

use super::{
    document_id, ensure_reachable, node_address, parse_response, CreateIndexSettings,
    DeleteByQueryResponse, GetSettingsResponse, IndexSetting, Indices, QueryResponse,
    SearchClient,
};
use crate::{
    errors::{Error, Result},
    maps::JsonMap,
    suite::TestScope,
};
use async_trait::async_trait;
use opensearch::{
    auth::Credentials,
    cat::CatIndicesParts,
    http::{
        transport::{SingleNodeConnectionPool, TransportBuilder},
        Url,
    },
    indices::{IndicesCloseParts, IndicesCreateParts, IndicesDeleteParts, IndicesGetSettingsParts},
    params::Refresh,
    DeleteByQueryParts, IndexParts, OpenSearch, SearchParts,
};
use serde_json::Value;
use testkit_settings::SearchSettings;

/// A [`SearchClient`] for OpenSearch.
#[derive(Clone, Debug)]
pub struct OpenSearchClient {
    /// The wrapped client, for anything the helpers don't cover.
    pub client: OpenSearch,
}

impl OpenSearchClient {
    /// Create a client for the first node in `settings`.
    ///
    /// # Errors
    /// If no address is configured, or it is not a valid URL.
    pub fn new(settings: &SearchSettings) -> Result<Self> {
        let address = node_address("opensearch", settings)?;
        let url = Url::parse(address).map_err(|source| Error::InvalidAddress {
            address: address.to_string(),
            source,
        })?;

        let mut transport_builder = TransportBuilder::new(SingleNodeConnectionPool::new(url));
        if let Some((username, password)) = settings.credentials() {
            transport_builder = transport_builder
                .auth(Credentials::Basic(username.to_string(), password.to_string()));
        }
        let transport = transport_builder
            .build()
            .map_err(opensearch::Error::from)?;

        Ok(Self {
            client: OpenSearch::new(transport),
        })
    }

    /// Ping the cluster, returning a short description of the answer.
    async fn ping(&self) -> Result<String> {
        let response = self.client.ping().send().await?;
        let status = response.status_code().as_u16();
        if status > 299 {
            return Err(Error::SearchStatus(status));
        }
        Ok(format!("{} {}", status, response.url()))
    }
}

#[async_trait]
impl SearchClient for OpenSearchClient {
    async fn create_index(&self, index: &str, settings: &CreateIndexSettings) -> Result<()> {
        tracing::debug!(%index, ?settings, "Creating index");
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(settings.body()?)
            .send()
            .await?;

        if !response.status_code().is_success() {
            let body = response.text().await?;
            tracing::debug!(%index, %body, "Failed to create index");
            return Err(Error::SearchRejected {
                action: "create index",
                body,
            });
        }
        Ok(())
    }

    async fn close_indices(&self, indices: &[&str]) {
        tracing::debug!(?indices, "Closing indices");
        let result = self
            .client
            .indices()
            .close(IndicesCloseParts::Index(indices))
            .send()
            .await;

        match result {
            Ok(response) if response.status_code().is_success() => (),
            Ok(response) => {
                let status = response.status_code().as_u16();
                let body = response.text().await.unwrap_or_default();
                tracing::debug!(?indices, %status, %body, "Failed to close indices");
            }
            Err(error) => tracing::debug!(?indices, %error, "Failed to close indices"),
        }
    }

    async fn find_indices(&self, pattern: &str) -> Result<Indices> {
        tracing::debug!(%pattern, "Finding indices");
        let response = self
            .client
            .cat()
            .indices(CatIndicesParts::Index(&[pattern]))
            .format("json")
            .send()
            .await?;

        let status = response.status_code().as_u16();
        let mut indices: Indices = parse_response(status, &response.text().await?)?;
        indices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(indices)
    }

    async fn get_index_settings(&self, index: &str) -> Result<IndexSetting> {
        tracing::debug!(%index, "Getting index settings");
        let response = self
            .client
            .indices()
            .get_settings(IndicesGetSettingsParts::Index(&[index]))
            .send()
            .await?;

        let status = response.status_code().as_u16();
        let mut settings: GetSettingsResponse = parse_response(status, &response.text().await?)?;
        Ok(settings
            .remove(index)
            .map(|wrapper| wrapper.settings.index)
            .unwrap_or_default())
    }

    async fn delete_indices(&self, pattern: &str) -> Result<()> {
        let indices = self.find_indices(pattern).await?;
        if indices.is_empty() {
            tracing::debug!(%pattern, "No indices to delete");
            return Ok(());
        }

        let names: Vec<&str> = indices.iter().map(|index| index.name.as_str()).collect();
        tracing::debug!(?names, "Deleting indices");
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&names))
            .send()
            .await?;

        let status = response.status_code().as_u16();
        parse_response::<Value>(status, &response.text().await?).map(|_| ())
    }

    async fn delete_by_query(&self, indices: &[&str], query: &str) -> Result<()> {
        tracing::debug!(?indices, %query, "Deleting by query");
        let query: Value = serde_json::from_str(query)?;
        let response = self
            .client
            .delete_by_query(DeleteByQueryParts::Index(indices))
            .body(query)
            .send()
            .await?;

        let status = response.status_code().as_u16();
        let result: DeleteByQueryResponse = parse_response(status, &response.text().await?)?;
        tracing::info!(deleted = result.deleted, "Deleted documents by query");
        Ok(())
    }

    async fn search_by_query(&self, index: &str, query: &str) -> Result<QueryResponse> {
        tracing::debug!(%index, %query, "Searching by query");
        let query: Value = serde_json::from_str(query)?;
        let response = self
            .client
            .search(SearchParts::Index(&[index]))
            .body(query)
            .send()
            .await?;

        let status = response.status_code().as_u16();
        let result: QueryResponse = parse_response(status, &response.text().await?)?;
        tracing::info!(found = result.hits.hits.len(), "Searched by query");
        Ok(result)
    }

    async fn create_document(
        &self,
        index: &str,
        doc_id: Option<&str>,
        document: &JsonMap,
    ) -> Result<()> {
        tracing::debug!(%index, "Creating document");
        let parts = match document_id(doc_id, document) {
            Some(id) => IndexParts::IndexId(index, id),
            None => IndexParts::Index(index),
        };
        let response = self
            .client
            .index(parts)
            .refresh(Refresh::True)
            .body(document)
            .send()
            .await?;

        if !response.status_code().is_success() {
            let body = response.text().await?;
            tracing::debug!(%index, %body, "Failed to create document");
            return Err(Error::SearchRejected {
                action: "create document",
                body,
            });
        }
        tracing::debug!(%index, "Document created");
        Ok(())
    }
}

impl TestScope {
    /// A client for the configured OpenSearch cluster.
    ///
    /// The client is built once per suite. The first time a process uses a
    /// cluster, it is pinged.
    ///
    /// # Errors
    /// If OpenSearch is not configured or cannot be reached.
    pub async fn requires_opensearch(&self) -> Result<OpenSearchClient> {
        let settings = self
            .settings()
            .opensearch
            .as_ref()
            .ok_or(Error::NotConfigured("opensearch"))?;

        let client = self
            .suite()
            .inner
            .opensearch
            .get_or_try_init(|| async {
                let client = OpenSearchClient::new(settings)?;
                ensure_reachable(format!("opensearch {}", settings.addresses), || {
                    client.ping()
                })
                .await?;
                Ok::<_, Error>(client)
            })
            .await?;
        Ok(client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::OpenSearchClient;
    use crate::{
        search::{CreateIndexSettings, SearchClient},
        Error, SuiteRunner,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use testkit_settings::SearchSettings;

    #[test]
    fn credentials_are_optional() {
        let mut settings = SearchSettings {
            addresses: "http://localhost:9201".to_string(),
            ..SearchSettings::default()
        };
        assert!(OpenSearchClient::new(&settings).is_ok());

        settings.username = "admin".to_string();
        settings.password = "admin".to_string();
        assert!(OpenSearchClient::new(&settings).is_ok());
    }

    #[tokio::test]
    async fn unconfigured_cluster_is_an_error() {
        SuiteRunner::new("NoOpenSearchSuite")
            .filter(".*")
            .settings(|settings| settings.opensearch = None)
            .test("requires_opensearch", |scope| async move {
                let error = scope.requires_opensearch().await.unwrap_err();
                assert_eq!(error.to_string(), "opensearch is not configured");
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }

    #[tokio::test]
    #[ignore = "requires a running OpenSearch cluster"]
    async fn documents_take_their_id_from_the_document() {
        SuiteRunner::new("OpenSearchSuite")
            .filter(".*")
            .test("document_ids", |scope| async move {
                let client = scope.requires_opensearch().await?;
                let index = format!("testkit-{}", uuid::Uuid::new_v4());

                client
                    .create_index(&index, &CreateIndexSettings::default())
                    .await?;
                let document = json!({"document_id": "invoice-9", "amount": 12});
                client
                    .create_document(&index, None, document.as_object().unwrap())
                    .await?;

                let found = client
                    .search_by_query(&index, r#"{"query": {"match_all": {}}}"#)
                    .await?;
                assert_eq!(found.hits.hits.len(), 1);
                assert_eq!(found.hits.hits[0].id, "invoice-9");
                assert_eq!(found.hits.hits[0].source["amount"], 12);

                assert_eq!(client.find_indices(&index).await?.len(), 1);
                client.delete_indices(&index).await?;
                assert!(client.find_indices(&index).await?.is_empty());
                Ok::<_, Error>(())
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }
}
