//! Elasticsearch and OpenSearch clients with the handful of operations tests
//! need to set up and inspect indices.

mod elasticsearch;
mod opensearch;

pub use self::{elasticsearch::ElasticsearchClient, opensearch::OpenSearchClient};

use crate::{
    errors::{Error, Result},
    maps::JsonMap,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
};
use testkit_settings::SearchSettings;

lazy_static::lazy_static! {
    /// Clusters that answered a ping, so each is only checked once per process.
    static ref REACHABLE_CLUSTERS: Mutex<HashSet<String>> = Mutex::default();
}

/// The field [`SearchClient::create_document`] takes the document id from,
/// when none is given.
pub const DOCUMENT_ID_FIELD: &str = "document_id";

/// Operations on an Elasticsearch or OpenSearch cluster.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Create `index` with the given settings.
    async fn create_index(&self, index: &str, settings: &CreateIndexSettings) -> Result<()>;

    /// Close `indices`. Failures are logged, not returned.
    async fn close_indices(&self, indices: &[&str]);

    /// Whether an index called `name` exists, ignoring case.
    async fn index_exists(&self, name: &str) -> Result<bool> {
        let indices = self.find_indices(name).await?;
        Ok(indices
            .iter()
            .any(|index| index.name.eq_ignore_ascii_case(name)))
    }

    /// The indices matching `pattern`, sorted by name.
    async fn find_indices(&self, pattern: &str) -> Result<Indices>;

    /// The settings of `index`, or defaults if it does not exist.
    async fn get_index_settings(&self, index: &str) -> Result<IndexSetting>;

    /// Delete every index matching `pattern`. Nothing matching is fine.
    async fn delete_indices(&self, pattern: &str) -> Result<()>;

    /// Delete the documents in `indices` that match `query`, a JSON query
    /// body.
    async fn delete_by_query(&self, indices: &[&str], query: &str) -> Result<()>;

    /// Search `index` with `query`, a JSON query body.
    async fn search_by_query(&self, index: &str, query: &str) -> Result<QueryResponse>;

    /// Index `document` into `index` and refresh, so it is searchable right
    /// away. Without `doc_id`, a string `document_id` field in the document
    /// is used as the id, and without that the cluster picks one.
    async fn create_document(
        &self,
        index: &str,
        doc_id: Option<&str>,
        document: &JsonMap,
    ) -> Result<()>;
}

/// How to create an index.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CreateIndexSettings {
    /// Primary shards. `0` means `1`.
    pub number_of_shards: u32,

    /// Replicas per shard. `0` means `1`.
    pub number_of_replicas: u32,

    /// Whether fields missing from the mapping are added automatically.
    pub dynamic: bool,

    /// Mapping properties.
    pub mapping_properties: JsonMap,

    /// Mapping properties as a JSON string. Takes precedence over
    /// [`mapping_properties`](Self::mapping_properties) when not empty.
    pub mapping_properties_string: Option<String>,
}

impl CreateIndexSettings {
    /// The body of a create index request.
    ///
    /// # Errors
    /// If [`mapping_properties_string`](Self::mapping_properties_string) is
    /// not valid JSON.
    pub fn body(&self) -> Result<Value> {
        let properties = match self.mapping_properties_string.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => Value::Object(self.mapping_properties.clone()),
        };

        Ok(json!({
            "settings": {
                "index": {
                    "number_of_shards": self.number_of_shards.max(1),
                    "number_of_replicas": self.number_of_replicas.max(1),
                }
            },
            "mappings": {
                "dynamic": self.dynamic,
                "properties": properties,
            }
        }))
    }
}

/// One row of the `_cat/indices` API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Index {
    /// The index name.
    #[serde(rename = "index")]
    pub name: String,
    /// `green`, `yellow` or `red`.
    pub health: String,
    /// `open` or `close`.
    pub status: String,
    /// The index UUID.
    pub uuid: String,
    /// Number of primary shards.
    pub pri: String,
    /// Number of replicas.
    pub rep: String,
    /// Number of documents.
    #[serde(rename = "docs.count")]
    pub docs_count: String,
    /// Number of deleted documents.
    #[serde(rename = "docs.deleted")]
    pub docs_deleted: String,
    /// Store size of all shards, such as `4.5kb`.
    #[serde(rename = "store.size")]
    pub store_size: String,
    /// Store size of the primary shards.
    #[serde(rename = "pri.store.size")]
    pub pri_store_size: String,
}

/// A list of indices.
pub type Indices = Vec<Index>;

/// The `index` settings of one index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSetting {
    /// Creation time in milliseconds since the Unix epoch.
    pub creation_date: String,
    /// Number of primary shards.
    pub number_of_shards: String,
    /// Number of replicas.
    pub number_of_replicas: String,
    /// The index UUID.
    pub uuid: String,
    /// Blocks, if any are set.
    pub blocks: Option<Blocks>,
    /// The name the index was created with.
    pub provided_name: String,
}

/// Blocks set on an index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Blocks {
    /// Whether writes are blocked.
    pub write: String,
    /// Whether reads are blocked.
    pub read: String,
    /// Whether metadata changes are blocked.
    pub metadata: String,
    /// Whether the index is read only.
    pub read_only: String,
}

/// The response of the get settings API, by index name.
pub type GetSettingsResponse = HashMap<String, SettingsWrapper>;

/// The settings of one index in a get settings response.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsWrapper {
    /// The settings themselves.
    pub settings: SettingsRoot,
}

/// Index settings, under the `index` key.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsRoot {
    /// The `index` settings.
    pub index: IndexSetting,
}

/// The response of a search.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryResponse {
    /// The matches.
    pub hits: Hits,
}

/// The `hits` of a search response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hits {
    /// Matching documents, best first.
    pub hits: Vec<Hit>,
}

/// One matching document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hit {
    /// The index the document is in.
    #[serde(rename = "_index")]
    pub index: String,
    /// The document id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Missing when results are sorted by something other than relevance.
    #[serde(rename = "_score")]
    pub score: Option<f64>,
    /// The document.
    #[serde(rename = "_source")]
    pub source: JsonMap,
}

/// The part of a delete by query response that gets logged.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct DeleteByQueryResponse {
    /// Number of documents deleted.
    pub(crate) deleted: u64,
}

/// Decode a response body: `404` gives the default value, and any other
/// status above `299` is an error.
pub(crate) fn parse_response<T>(status: u16, body: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if status == 404 {
        return Ok(T::default());
    }
    if status > 299 {
        return Err(Error::SearchStatus(status));
    }
    Ok(serde_json::from_str(body)?)
}

/// The id to index `document` under.
pub(crate) fn document_id<'a>(doc_id: Option<&'a str>, document: &'a JsonMap) -> Option<&'a str> {
    doc_id
        .filter(|id| !id.is_empty())
        .or_else(|| document.get(DOCUMENT_ID_FIELD).and_then(Value::as_str))
}

/// The node to talk to. Only the first configured address is used.
pub(crate) fn node_address<'a>(kind: &'static str, settings: &'a SearchSettings) -> Result<&'a str> {
    let addresses = settings.addresses();
    let Some(first) = addresses.first() else {
        return Err(Error::NotConfigured(kind));
    };
    if addresses.len() > 1 {
        tracing::warn!(
            cluster = kind,
            address = %first,
            ignored = addresses.len() - 1,
            "Only the first search cluster address is used"
        );
    }
    Ok(first)
}

/// Run `ping` unless a ping to the same cluster already succeeded in this
/// process.
pub(crate) async fn ensure_reachable<F, Fut>(key: String, ping: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    let known = REACHABLE_CLUSTERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&key);
    if known {
        return Ok(());
    }

    let response = ping().await?;
    tracing::info!(cluster = %key, %response, "Connected to search cluster");
    REACHABLE_CLUSTERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        document_id, node_address, parse_response, CreateIndexSettings, GetSettingsResponse,
        Indices, QueryResponse,
    };
    use crate::Error;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use testkit_settings::SearchSettings;

    #[test]
    fn create_index_body_defaults_to_one_shard_and_replica() {
        let settings = CreateIndexSettings {
            mapping_properties: json!({"name": {"type": "keyword"}})
                .as_object()
                .unwrap()
                .clone(),
            ..CreateIndexSettings::default()
        };

        assert_eq!(
            settings.body().unwrap(),
            json!({
                "settings": {"index": {"number_of_shards": 1, "number_of_replicas": 1}},
                "mappings": {"dynamic": false, "properties": {"name": {"type": "keyword"}}}
            })
        );
    }

    #[test]
    fn create_index_body_prefers_raw_properties() {
        let settings = CreateIndexSettings {
            number_of_shards: 3,
            number_of_replicas: 2,
            dynamic: true,
            mapping_properties: json!({"ignored": {"type": "text"}})
                .as_object()
                .unwrap()
                .clone(),
            mapping_properties_string: Some(r#"{"id": {"type": "long"}}"#.to_string()),
        };

        assert_eq!(
            settings.body().unwrap(),
            json!({
                "settings": {"index": {"number_of_shards": 3, "number_of_replicas": 2}},
                "mappings": {"dynamic": true, "properties": {"id": {"type": "long"}}}
            })
        );
    }

    #[test]
    fn create_index_body_rejects_bad_raw_properties() {
        let settings = CreateIndexSettings {
            mapping_properties_string: Some("{not json".to_string()),
            ..CreateIndexSettings::default()
        };
        assert!(matches!(settings.body(), Err(Error::Json(_))));
    }

    #[test]
    fn not_found_is_the_default() {
        let indices: Indices = parse_response(404, "{\"error\": \"missing\"}").unwrap();
        assert!(indices.is_empty());
    }

    #[test]
    fn error_statuses_are_errors() {
        let error = parse_response::<Indices>(503, "").unwrap_err();
        assert_eq!(error.to_string(), "received status code: 503");
    }

    #[test]
    fn cat_indices_rows_are_decoded() {
        let indices: Indices = parse_response(
            200,
            r#"[{"health":"yellow","status":"open","index":"orders","uuid":"u1","pri":"1","rep":"1","docs.count":"3","docs.deleted":"0","store.size":"1kb","pri.store.size":"1kb"}]"#,
        )
        .unwrap();

        assert_eq!(indices.len(), 1);
        assert_eq!(indices[0].name, "orders");
        assert_eq!(indices[0].docs_count, "3");
    }

    #[test]
    fn settings_and_hits_are_decoded() {
        let settings: GetSettingsResponse = parse_response(
            200,
            r#"{"orders":{"settings":{"index":{"number_of_shards":"2","number_of_replicas":"1","uuid":"u1","provided_name":"orders","creation_date":"1700000000000","blocks":{"write":"true"}}}}}"#,
        )
        .unwrap();
        let index = &settings["orders"].settings.index;
        assert_eq!(index.number_of_shards, "2");
        assert_eq!(index.blocks.as_ref().unwrap().write, "true");

        let response: QueryResponse = parse_response(
            200,
            r#"{"took":1,"hits":{"total":{"value":1},"hits":[{"_index":"orders","_id":"1","_score":null,"_source":{"name":"book"}}]}}"#,
        )
        .unwrap();
        assert_eq!(response.hits.hits[0].id, "1");
        assert_eq!(response.hits.hits[0].score, None);
        assert_eq!(response.hits.hits[0].source["name"], "book");
    }

    #[test]
    fn document_id_falls_back_to_field() {
        let document = json!({"document_id": "order-7", "total": 10});
        let document = document.as_object().unwrap();

        assert_eq!(document_id(Some("given"), document), Some("given"));
        assert_eq!(document_id(None, document), Some("order-7"));
        assert_eq!(document_id(Some(""), document), Some("order-7"));

        let numeric = json!({"document_id": 7});
        assert_eq!(document_id(None, numeric.as_object().unwrap()), None);
    }

    #[test]
    fn first_address_is_used() {
        let settings = SearchSettings {
            addresses: "http://one:9200, http://two:9200".to_string(),
            ..SearchSettings::default()
        };
        assert_eq!(
            node_address("elasticsearch", &settings).unwrap(),
            "http://one:9200"
        );

        let empty = SearchSettings::default();
        assert!(matches!(
            node_address("opensearch", &empty),
            Err(Error::NotConfigured("opensearch"))
        ));
    }
}
