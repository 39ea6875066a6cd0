use std::sync::LazyLock;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::modules::context::Initialize;
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::message::category::EmailCategory;
use crate::modules::search::query::{
    account_term_query, category_aggregation_body, emails_index_body, ids_listing_body,
    search_body, SearchFilters,
};
use crate::modules::settings::cli::SETTINGS;
use crate::{mailsift_version, raise_error};

pub mod query;

pub const EMAILS_INDEX: &str = "emails";

static SEARCH_STORE: LazyLock<SearchStore> = LazyLock::new(SearchStore::new);

#[derive(Debug, Default, PartialEq)]
pub struct IndexOutcome {
    pub indexed: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct SearchPage {
    pub hits: Vec<Value>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

/// Thin typed client over the search engine's REST API. One instance and
/// one connection pool are shared process-wide.
pub struct SearchStore {
    client: reqwest::Client,
    base_url: String,
}

impl SearchStore {
    fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("MailSift/{}", mailsift_version!()))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build the search store HTTP client");
        Self {
            client,
            base_url: SETTINGS.mailsift_search_store_url.clone(),
        }
    }

    pub fn get() -> &'static SearchStore {
        &SEARCH_STORE
    }

    /// Creates the `emails` index if it does not exist yet. An
    /// already-exists answer is not an error.
    pub async fn ensure_index(&self) -> MailSiftResult<()> {
        let url = format!("{}/{}", self.base_url, EMAILS_INDEX);
        let response = self
            .client
            .put(&url)
            .json(&emails_index_body())
            .send()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;
        if response.status().is_success() {
            info!("Created search index '{}'", EMAILS_INDEX);
            return Ok(());
        }
        let body: Value = response.json().await.unwrap_or_default();
        let error_type = body["error"]["type"].as_str().unwrap_or_default();
        if error_type == "resource_already_exists_exception" {
            debug!("Search index '{}' already exists", EMAILS_INDEX);
            return Ok(());
        }
        Err(raise_error!(
            format!("Failed to create the search index: {}", body),
            ErrorCode::SearchStoreFailed
        ))
    }

    /// Bulk index with an `_mget` pre-check: ids already present are skipped
    /// unless `force_update`, which makes re-index runs overwrite in place.
    pub async fn bulk_index(
        &self,
        docs: Vec<(String, Value)>,
        force_update: bool,
    ) -> MailSiftResult<IndexOutcome> {
        if docs.is_empty() {
            return Ok(IndexOutcome::default());
        }

        let total = docs.len();
        let to_write: Vec<(String, Value)> = if force_update {
            docs
        } else {
            let existing = self
                .multi_get_found(docs.iter().map(|(id, _)| id.clone()).collect())
                .await?;
            docs.into_iter()
                .filter(|(id, _)| !existing.contains(id))
                .collect()
        };

        let mut outcome = IndexOutcome {
            indexed: 0,
            skipped: total - to_write.len(),
        };
        if to_write.is_empty() {
            return Ok(outcome);
        }

        let mut ndjson = String::new();
        let batch = to_write.len();
        for (id, doc) in to_write {
            ndjson.push_str(&json!({ "index": { "_index": EMAILS_INDEX, "_id": id } }).to_string());
            ndjson.push('\n');
            ndjson.push_str(&doc.to_string());
            ndjson.push('\n');
        }
        let body = self.bulk_request(ndjson).await?;
        let failed = count_bulk_errors(&body);
        if failed > 0 {
            warn!("{} of {} bulk index operations failed", failed, batch);
        }
        outcome.indexed = batch - failed;
        Ok(outcome)
    }

    /// How many of `ids` are already indexed; used to report `skipped`.
    pub async fn multi_get_found(
        &self,
        ids: Vec<String>,
    ) -> MailSiftResult<std::collections::HashSet<String>> {
        if ids.is_empty() {
            return Ok(Default::default());
        }
        let url = format!("{}/{}/_mget", self.base_url, EMAILS_INDEX);
        let body: Value = self
            .send_json(self.client.post(&url).json(&json!({ "ids": ids })))
            .await?;
        let found = body["docs"]
            .as_array()
            .map(|docs| {
                docs.iter()
                    .filter(|d| d["found"].as_bool().unwrap_or(false))
                    .filter_map(|d| d["_id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(found)
    }

    /// Partial per-document updates only; the rest of the document is left
    /// untouched.
    pub async fn bulk_update_categories(
        &self,
        updates: &[(String, EmailCategory)],
    ) -> MailSiftResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut ndjson = String::new();
        for (id, category) in updates {
            ndjson.push_str(&json!({ "update": { "_index": EMAILS_INDEX, "_id": id } }).to_string());
            ndjson.push('\n');
            ndjson.push_str(&json!({ "doc": { "category": category.label() } }).to_string());
            ndjson.push('\n');
        }
        let body = self.bulk_request(ndjson).await?;
        let failed = count_bulk_errors(&body);
        if failed > 0 {
            warn!("{} category updates failed in the search store", failed);
        }
        Ok(())
    }

    /// Full-text search scoped to the caller's allowed accounts. An empty
    /// scope returns an empty page without touching the engine.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        allowed_account_ids: &[u64],
        page: u64,
        limit: u64,
    ) -> MailSiftResult<SearchPage> {
        let out_of_scope = filters
            .account
            .is_some_and(|account| !allowed_account_ids.contains(&account));
        if allowed_account_ids.is_empty() || out_of_scope {
            return Ok(SearchPage {
                hits: Vec::new(),
                total: 0,
                page,
                limit,
                total_pages: 0,
            });
        }
        let url = format!("{}/{}/_search", self.base_url, EMAILS_INDEX);
        let request_body = search_body(query, filters, allowed_account_ids, page, limit);
        let body: Value = self
            .send_json(self.client.post(&url).json(&request_body))
            .await?;
        let total = body["hits"]["total"]["value"].as_u64().unwrap_or(0);
        let hits = body["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .map(|hit| {
                        let mut source = hit["_source"].clone();
                        source["id"] = hit["_id"].clone();
                        source
                    })
                    .collect()
            })
            .unwrap_or_default();
        let total_pages = if limit > 0 {
            (total as f64 / limit as f64).ceil() as u64
        } else {
            0
        };
        Ok(SearchPage {
            hits,
            total,
            page,
            limit,
            total_pages,
        })
    }

    /// Category buckets for the caller's accounts; unclassified documents
    /// surface in a distinct `uncategorized` bucket.
    pub async fn category_counts(
        &self,
        allowed_account_ids: &[u64],
    ) -> MailSiftResult<Vec<(String, u64)>> {
        if allowed_account_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/{}/_search", self.base_url, EMAILS_INDEX);
        let body: Value = self
            .send_json(
                self.client
                    .post(&url)
                    .json(&category_aggregation_body(allowed_account_ids)),
            )
            .await?;
        let buckets = body["aggregations"]["categories"]["buckets"]
            .as_array()
            .map(|buckets| {
                buckets
                    .iter()
                    .filter_map(|bucket| {
                        Some((
                            bucket["key"].as_str()?.to_string(),
                            bucket["doc_count"].as_u64().unwrap_or(0),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(buckets)
    }

    pub async fn count_by_account(&self, account_id: u64) -> MailSiftResult<u64> {
        let url = format!("{}/{}/_count", self.base_url, EMAILS_INDEX);
        let body: Value = self
            .send_json(self.client.post(&url).json(&account_term_query(account_id)))
            .await?;
        Ok(body["count"].as_u64().unwrap_or(0))
    }

    pub async fn list_ids_by_account(
        &self,
        account_id: u64,
        cap: u64,
    ) -> MailSiftResult<Vec<String>> {
        let url = format!("{}/{}/_search", self.base_url, EMAILS_INDEX);
        let body: Value = self
            .send_json(
                self.client
                    .post(&url)
                    .json(&ids_listing_body(account_id, cap)),
            )
            .await?;
        let ids = body["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| hit["_id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    pub async fn delete_by_account(&self, account_id: u64) -> MailSiftResult<u64> {
        let url = format!("{}/{}/_delete_by_query", self.base_url, EMAILS_INDEX);
        let body: Value = self
            .send_json(self.client.post(&url).json(&account_term_query(account_id)))
            .await?;
        Ok(body["deleted"].as_u64().unwrap_or(0))
    }

    async fn bulk_request(&self, ndjson: String) -> MailSiftResult<Value> {
        let url = format!("{}/_bulk", self.base_url);
        self.send_json(
            self.client
                .post(&url)
                .header("Content-Type", "application/x-ndjson")
                .body(ndjson),
        )
        .await
    }

    async fn send_json(&self, request: reqwest::RequestBuilder) -> MailSiftResult<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;
        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            raise_error!(
                format!("Search store returned a non-JSON body: {:#?}", e),
                ErrorCode::SearchStoreFailed
            )
        })?;
        if !status.is_success() {
            return Err(raise_error!(
                format!("Search store request failed ({}): {}", status, body),
                ErrorCode::SearchStoreFailed
            ));
        }
        Ok(body)
    }
}

fn count_bulk_errors(body: &Value) -> usize {
    if !body["errors"].as_bool().unwrap_or(false) {
        return 0;
    }
    body["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter(|item| {
                    let op = item
                        .get("index")
                        .or_else(|| item.get("update"))
                        .unwrap_or(&Value::Null);
                    op.get("error").is_some()
                })
                .count()
        })
        .unwrap_or(0)
}

impl Initialize for SearchStore {
    async fn initialize() -> MailSiftResult<()> {
        SearchStore::get().ensure_index().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_error_counting() {
        let clean = json!({ "errors": false, "items": [] });
        assert_eq!(count_bulk_errors(&clean), 0);

        let mixed = json!({
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 201 } },
                { "index": { "_id": "b", "error": { "type": "mapper_parsing_exception" } } },
                { "update": { "_id": "c", "error": { "type": "document_missing_exception" } } }
            ]
        });
        assert_eq!(count_bulk_errors(&mixed), 2);
    }
}
