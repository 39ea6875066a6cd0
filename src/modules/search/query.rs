use serde_json::{json, Value};

use crate::modules::message::category::EmailCategory;

/// Filters accepted by the search surface. `allowed_account_ids` is the
/// caller's scoping set, applied on top of any explicit `account` filter.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub account: Option<u64>,
    pub folder: Option<String>,
    pub category: Option<EmailCategory>,
}

/// Index mappings for the `emails` index. Folder equality is
/// case-insensitive via the lowercase normalizer; `category` is a keyword
/// so the aggregation can bucket it.
pub fn emails_index_body() -> Value {
    json!({
        "settings": {
            "analysis": {
                "normalizer": {
                    "lowercase_normalizer": {
                        "type": "custom",
                        "filter": ["lowercase"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "account": { "type": "keyword" },
                "folder": { "type": "keyword", "normalizer": "lowercase_normalizer" },
                "subject": { "type": "text" },
                "from": {
                    "properties": {
                        "name": { "type": "text" },
                        "address": { "type": "keyword" }
                    }
                },
                "to": {
                    "type": "nested",
                    "properties": {
                        "name": { "type": "text" },
                        "address": { "type": "keyword" }
                    }
                },
                "date": { "type": "date" },
                "body": { "type": "text" },
                "textBody": { "type": "text" },
                "htmlBody": { "type": "text" },
                "flags": { "type": "keyword" },
                "category": { "type": "keyword" },
                "uid": { "type": "keyword" }
            }
        }
    })
}

/// A `bool` query combining the free-text multi-match with the caller's
/// scope and filters. Expects a non-empty `allowed_account_ids`; the empty
/// set is handled before any request is built.
pub fn search_body(
    query: &str,
    filters: &SearchFilters,
    allowed_account_ids: &[u64],
    page: u64,
    limit: u64,
) -> Value {
    let mut must: Vec<Value> = Vec::new();
    if !query.trim().is_empty() {
        must.push(json!({
            "multi_match": {
                "query": query,
                "fields": ["subject", "body", "from.name", "from.address"]
            }
        }));
    }

    let mut filter = vec![scope_filter(allowed_account_ids)];
    if let Some(account) = filters.account {
        filter.push(json!({ "term": { "account": account.to_string() } }));
    }
    if let Some(folder) = &filters.folder {
        filter.push(json!({ "term": { "folder": folder } }));
    }
    if let Some(category) = filters.category {
        filter.push(json!({ "term": { "category": category.label() } }));
    }

    let from = page.saturating_sub(1) * limit;
    json!({
        "query": {
            "bool": {
                "must": must,
                "filter": filter
            }
        },
        "sort": [{ "date": { "order": "desc" } }],
        "from": from,
        "size": limit
    })
}

pub fn scope_filter(allowed_account_ids: &[u64]) -> Value {
    let ids: Vec<String> = allowed_account_ids.iter().map(|id| id.to_string()).collect();
    json!({ "terms": { "account": ids } })
}

pub fn category_aggregation_body(allowed_account_ids: &[u64]) -> Value {
    json!({
        "size": 0,
        "query": { "bool": { "filter": [scope_filter(allowed_account_ids)] } },
        "aggs": {
            "categories": {
                "terms": {
                    "field": "category",
                    "missing": "uncategorized"
                }
            }
        }
    })
}

pub fn account_term_query(account_id: u64) -> Value {
    json!({ "query": { "term": { "account": account_id.to_string() } } })
}

pub fn ids_listing_body(account_id: u64, cap: u64) -> Value {
    json!({
        "query": { "term": { "account": account_id.to_string() } },
        "_source": false,
        "size": cap
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_body_combines_text_and_filters() {
        let filters = SearchFilters {
            account: Some(42),
            folder: Some("inbox".into()),
            category: Some(EmailCategory::Interested),
        };
        let body = search_body("pricing", &filters, &[42, 43], 2, 20);

        let must = &body["query"]["bool"]["must"];
        assert_eq!(must[0]["multi_match"]["query"], "pricing");
        assert_eq!(
            must[0]["multi_match"]["fields"],
            serde_json::json!(["subject", "body", "from.name", "from.address"])
        );

        let filter = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filter[0]["terms"]["account"], serde_json::json!(["42", "43"]));
        assert_eq!(filter[1]["term"]["account"], "42");
        assert_eq!(filter[2]["term"]["folder"], "inbox");
        assert_eq!(filter[3]["term"]["category"], "Interested");

        assert_eq!(body["from"], 20);
        assert_eq!(body["size"], 20);
        assert_eq!(body["sort"][0]["date"]["order"], "desc");
    }

    #[test]
    fn empty_query_omits_multi_match() {
        let body = search_body("", &SearchFilters::default(), &[1], 1, 10);
        assert!(body["query"]["bool"]["must"].as_array().unwrap().is_empty());
    }

    #[test]
    fn aggregation_reports_missing_as_uncategorized() {
        let body = category_aggregation_body(&[7]);
        assert_eq!(
            body["aggs"]["categories"]["terms"]["missing"],
            "uncategorized"
        );
        assert_eq!(body["size"], 0);
    }

    #[test]
    fn mappings_normalize_folder_and_nest_recipients() {
        let body = emails_index_body();
        assert_eq!(
            body["mappings"]["properties"]["folder"]["normalizer"],
            "lowercase_normalizer"
        );
        assert_eq!(body["mappings"]["properties"]["to"]["type"], "nested");
        assert_eq!(body["mappings"]["properties"]["category"]["type"], "keyword");
    }
}
