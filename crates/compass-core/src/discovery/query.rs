//! Request bodies of search, suggest and group queries, and decoding of
//! their responses.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::asset::{
    Asset, GroupConfig, GroupField, GroupResult, SearchConfig, SearchFilter, SearchResult,
    DEFAULT_GROUP_SIZE, DEFAULT_MAX_RESULTS,
};
use crate::config::SearchConfigDefaults;
use crate::error::{CompassError, DiscoveryError, Result};

pub const MIN_SCORE: f64 = 0.01;
pub const SUGGESTER_NAME: &str = "name-phrase-suggest";
const GROUP_AGGREGATION: &str = "composite-group";
const TOP_HITS: &str = "top-hits";
const IS_DELETED: &str = "is_deleted";

/// Fields returned by a search unless the caller asks for more.
pub const RETURNED_FIELDS: &[&str] = &[
    "id",
    "urn",
    "type",
    "service",
    "name",
    "description",
    "data",
    "labels",
    "created_at",
    "updated_at",
    "is_deleted",
];

const BOOSTED_FIELDS: &[&str] = &["urn^10", "name^5"];
const COLUMN_FIELDS: &[&str] = &["data.columns.name^10", "data.columns.description"];
const COLUMN_HIGHLIGHT_FIELDS: &[&str] = &["data.columns.name", "data.columns.description"];

/// Body of a search request.
pub fn build_search_body(cfg: &SearchConfig, exclusion_list: &[String]) -> Result<Value> {
    let text = cfg.text.trim();
    let fuzzy = !cfg.flags.disable_fuzzy;

    let should = if text.is_empty() {
        vec![json!({ "match_all": {} })]
    } else if cfg.flags.is_column_search {
        column_text_queries(text, exclusion_list, fuzzy)
    } else {
        text_queries(text, fuzzy)
    };

    let mut filter = filter_term_queries(&cfg.filters);
    filter.extend(cfg.queries.iter().map(|(field, value)| {
        let mut clause = json!({ "query": value });
        if fuzzy {
            clause["fuzziness"] = json!("AUTO");
        }
        json!({ "match": { field.as_str(): clause } })
    }));
    if let Some(clause) = implicit_is_deleted(&cfg.filters, Some(&cfg.queries))? {
        filter.push(clause);
    }

    let query = json!({
        "bool": {
            "should": should,
            "minimum_should_match": 1,
            "filter": filter,
        }
    });

    let main_field = if cfg.flags.is_column_search {
        "data.columns.name.keyword"
    } else {
        "name.keyword"
    };
    let rank_by = if cfg.rank_by.is_empty() {
        SearchConfigDefaults::DEFAULT_RANK_BY
    } else {
        cfg.rank_by.as_str()
    };
    let mut functions = Vec::new();
    if !text.is_empty() {
        functions.push(json!({ "filter": { "term": { main_field: text } }, "weight": 50 }));
    }
    functions.push(json!({
        "filter": { "term": { "data.attributes.category.keyword": "ssot" } },
        "weight": 10
    }));
    functions.push(json!({
        "field_value_factor": { "field": rank_by, "modifier": "log1p", "missing": 0 }
    }));

    let mut includes: Vec<String> = RETURNED_FIELDS.iter().map(|f| f.to_string()).collect();
    for field in &cfg.include_fields {
        if !includes.contains(field) {
            includes.push(field.clone());
        }
    }

    let size = if cfg.max_results == 0 {
        DEFAULT_MAX_RESULTS
    } else {
        cfg.max_results
    };
    let mut body = json!({
        "from": cfg.offset,
        "size": size,
        "min_score": MIN_SCORE,
        "_source": { "includes": includes },
        "query": {
            "function_score": {
                "query": query,
                "functions": functions,
                "score_mode": "sum",
            }
        },
    });
    if cfg.flags.enable_highlight {
        let fields: &[&str] = if cfg.flags.is_column_search {
            COLUMN_HIGHLIGHT_FIELDS
        } else {
            &["urn", "name"]
        };
        let fields: Map<String, Value> = fields
            .iter()
            .map(|f| (f.to_string(), json!({})))
            .collect();
        body["highlight"] = json!({ "fields": fields });
    }
    Ok(body)
}

fn text_queries(text: &str, fuzzy: bool) -> Vec<Value> {
    let mut and_query = json!({ "query": text, "fields": BOOSTED_FIELDS, "operator": "and" });
    let mut or_query = json!({ "query": text, "operator": "or" });
    if fuzzy {
        and_query["fuzziness"] = json!("AUTO");
        or_query["fuzziness"] = json!("AUTO");
    }
    vec![
        json!({ "multi_match": { "query": text, "fields": BOOSTED_FIELDS, "type": "phrase" } }),
        json!({ "multi_match": and_query }),
        json!({ "multi_match": or_query }),
    ]
}

fn column_text_queries(text: &str, exclusion_list: &[String], fuzzy: bool) -> Vec<Value> {
    let stripped = strip_excluded(text, exclusion_list);
    let mut queries = vec![json!({
        "multi_match": { "query": text, "fields": COLUMN_FIELDS, "type": "phrase" }
    })];
    if stripped.is_empty() {
        return queries;
    }
    let mut and_query = json!({ "query": stripped, "fields": COLUMN_FIELDS, "operator": "and" });
    let mut or_query = json!({ "query": stripped, "fields": COLUMN_FIELDS, "operator": "or" });
    if fuzzy {
        and_query["fuzziness"] = json!("AUTO");
        or_query["fuzziness"] = json!("AUTO");
    }
    queries.push(json!({ "multi_match": and_query }));
    queries.push(json!({ "multi_match": or_query }));
    queries
}

/// Drop excluded keywords (case-insensitive) from the user text.
fn strip_excluded(text: &str, exclusion_list: &[String]) -> String {
    text.split_whitespace()
        .filter(|word| !exclusion_list.iter().any(|ex| ex.eq_ignore_ascii_case(word)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One term clause per non-empty filter.
fn filter_term_queries(filters: &SearchFilter) -> Vec<Value> {
    let mut queries = Vec::new();
    for (key, values) in filters {
        match values.as_slice() {
            [] => continue,
            [single] => match single.parse::<bool>() {
                Ok(flag) => queries.push(json!({ "term": { key.as_str(): flag } })),
                Err(_) => queries.push(json!({ "term": { format!("{key}.keyword"): single } })),
            },
            many => queries.push(json!({ "terms": { format!("{key}.keyword"): many } })),
        }
    }
    queries
}

/// `is_deleted = false` unless the caller constrains the field.
fn implicit_is_deleted(
    filters: &SearchFilter,
    queries: Option<&BTreeMap<String, String>>,
) -> Result<Option<Value>> {
    let filtered = filters.get(IS_DELETED).filter(|values| !values.is_empty());
    let queried = queries.and_then(|q| q.get(IS_DELETED));
    match (filtered, queried) {
        (Some(values), Some(value)) if values.len() != 1 || &values[0] != value => {
            Err(CompassError::ConflictingFilter {
                field: IS_DELETED.to_string(),
            })
        }
        (None, None) => Ok(Some(json!({ "term": { IS_DELETED: false } }))),
        _ => Ok(None),
    }
}

/// Body of a completion suggestion request.
pub fn build_suggest_body(cfg: &SearchConfig) -> Value {
    json!({
        "suggest": {
            SUGGESTER_NAME: {
                "text": cfg.text,
                "completion": {
                    "field": "name.suggest",
                    "skip_duplicates": true,
                    "size": SearchConfigDefaults::SUGGEST_SIZE,
                }
            }
        }
    })
}

/// Body of a group request: a composite aggregation over the group-by
/// fields with the matching documents as top hits.
pub fn build_group_body(cfg: &GroupConfig) -> Result<Value> {
    if cfg.group_by.first().map_or(true, |field| field.is_empty()) {
        return Err(DiscoveryError::new("GroupAssets", "group by field cannot be empty").into());
    }
    let size = if cfg.size == 0 { DEFAULT_GROUP_SIZE } else { cfg.size };

    let mut filter = filter_term_queries(&cfg.filters);
    if let Some(clause) = implicit_is_deleted(&cfg.filters, None)? {
        filter.push(clause);
    }

    let sources: Vec<Value> = cfg
        .group_by
        .iter()
        .map(|field| json!({ field.as_str(): { "terms": { "field": group_field(field) } } }))
        .collect();

    let mut includes = cfg.group_by.clone();
    includes.extend(cfg.included_fields.iter().cloned());
    if !includes.iter().any(|f| f == IS_DELETED) {
        includes.push(IS_DELETED.to_string());
    }

    Ok(json!({
        "size": 0,
        "query": { "bool": { "filter": filter } },
        "aggs": {
            GROUP_AGGREGATION: {
                "composite": { "size": size, "sources": sources },
                "aggs": {
                    TOP_HITS: {
                        "top_hits": { "size": size, "_source": { "includes": includes } }
                    }
                }
            }
        }
    }))
}

fn group_field(field: &str) -> String {
    if field == IS_DELETED {
        field.to_string()
    } else {
        format!("{field}.keyword")
    }
}

fn hits(body: &Value) -> &[Value] {
    body["hits"]["hits"].as_array().map_or(&[][..], Vec::as_slice)
}

/// Decode the hits of a search response.
pub fn to_search_results(body: &Value) -> Vec<SearchResult> {
    hits(body)
        .iter()
        .map(|hit| {
            let source = &hit["_source"];
            let text = |key: &str| source[key].as_str().unwrap_or_default().to_string();
            let urn = text("urn");
            let id = match text("id") {
                id if id.is_empty() => urn.clone(),
                id => id,
            };
            let mut data = source["data"].as_object().cloned().unwrap_or_default();
            if let Some(highlight) = hit.get("highlight") {
                data.insert("_highlight".to_string(), highlight.clone());
            }
            SearchResult {
                id,
                urn,
                title: text("name"),
                asset_type: text("type"),
                service: text("service"),
                description: text("description"),
                labels: serde_json::from_value(source["labels"].clone()).unwrap_or_default(),
                data,
            }
        })
        .collect()
}

/// Decode the options of a suggestion response.
pub fn to_suggestions(body: &Value) -> Result<Vec<String>> {
    let suggests = body["suggest"][SUGGESTER_NAME].as_array().ok_or_else(|| {
        DiscoveryError::new("Suggest", "suggester key does not exist")
    })?;
    Ok(suggests
        .iter()
        .flat_map(|s| s["options"].as_array().map_or(&[][..], Vec::as_slice))
        .filter_map(|option| option["text"].as_str().map(str::to_string))
        .collect())
}

/// Decode the buckets of a group response, keeping the group-by order of
/// the key fields.
pub fn to_group_results(body: &Value, group_by: &[String]) -> Result<Vec<GroupResult>> {
    let buckets = body["aggregations"][GROUP_AGGREGATION]["buckets"]
        .as_array()
        .map_or(&[][..], Vec::as_slice);
    let mut results = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let fields = group_by
            .iter()
            .map(|name| GroupField {
                name: name.clone(),
                value: match &bucket["key"][name.as_str()] {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                },
            })
            .collect();
        let assets = hits(&bucket[TOP_HITS])
            .iter()
            .map(|hit| serde_json::from_value::<Asset>(hit["_source"].clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        results.push(GroupResult { fields, assets });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::SearchFlags;

    fn search(text: &str) -> SearchConfig {
        SearchConfig {
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn bool_query(body: &Value) -> &Value {
        &body["query"]["function_score"]["query"]["bool"]
    }

    #[test]
    fn test_empty_text_matches_all() {
        let body = build_search_body(&search("  "), &[]).unwrap();
        assert_eq!(bool_query(&body)["should"], json!([{ "match_all": {} }]));
        assert_eq!(body["size"], DEFAULT_MAX_RESULTS);
        assert_eq!(body["min_score"], MIN_SCORE);
    }

    #[test]
    fn test_text_queries_and_fuzziness() {
        let body = build_search_body(&search("orders"), &[]).unwrap();
        let should = bool_query(&body)["should"].as_array().unwrap().clone();
        assert_eq!(should.len(), 3);
        assert_eq!(should[0]["multi_match"]["type"], "phrase");
        assert!(should[0]["multi_match"].get("fuzziness").is_none());
        assert_eq!(should[1]["multi_match"]["operator"], "and");
        assert_eq!(should[1]["multi_match"]["fuzziness"], "AUTO");
        assert_eq!(should[2]["multi_match"]["operator"], "or");

        let mut cfg = search("orders");
        cfg.flags.disable_fuzzy = true;
        let body = build_search_body(&cfg, &[]).unwrap();
        for clause in bool_query(&body)["should"].as_array().unwrap() {
            assert!(clause["multi_match"].get("fuzziness").is_none());
        }
    }

    #[test]
    fn test_column_search_strips_excluded_words() {
        let cfg = SearchConfig {
            text: "the customer id".to_string(),
            flags: SearchFlags {
                is_column_search: true,
                enable_highlight: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let body = build_search_body(&cfg, &["THE".to_string()]).unwrap();
        let should = bool_query(&body)["should"].as_array().unwrap().clone();
        assert_eq!(should[0]["multi_match"]["query"], "the customer id");
        assert_eq!(should[1]["multi_match"]["query"], "customer id");
        assert_eq!(should[1]["multi_match"]["fields"][0], "data.columns.name^10");
        assert!(body["highlight"]["fields"]["data.columns.name"].is_object());
        assert_eq!(
            body["query"]["function_score"]["functions"][0]["filter"]["term"]
                ["data.columns.name.keyword"],
            "the customer id"
        );
    }

    #[test]
    fn test_filters_and_implicit_is_deleted() {
        let mut cfg = search("orders");
        cfg.filters.insert("service".to_string(), vec!["bq".to_string()]);
        cfg.filters.insert(
            "type".to_string(),
            vec!["table".to_string(), "topic".to_string()],
        );
        cfg.queries.insert("data.owner".to_string(), "john".to_string());
        let body = build_search_body(&cfg, &[]).unwrap();
        let filter = bool_query(&body)["filter"].as_array().unwrap().clone();
        assert!(filter.contains(&json!({ "term": { "service.keyword": "bq" } })));
        assert!(filter.contains(&json!({ "terms": { "type.keyword": ["table", "topic"] } })));
        assert!(filter.contains(
            &json!({ "match": { "data.owner": { "query": "john", "fuzziness": "AUTO" } } })
        ));
        assert!(filter.contains(&json!({ "term": { "is_deleted": false } })));

        let mut cfg = search("orders");
        cfg.filters.insert("is_deleted".to_string(), vec!["true".to_string()]);
        let body = build_search_body(&cfg, &[]).unwrap();
        let filter = bool_query(&body)["filter"].as_array().unwrap().clone();
        assert_eq!(filter, vec![json!({ "term": { "is_deleted": true } })]);
    }

    #[test]
    fn test_conflicting_is_deleted() {
        let mut cfg = search("orders");
        cfg.filters.insert("is_deleted".to_string(), vec!["true".to_string()]);
        cfg.queries.insert("is_deleted".to_string(), "false".to_string());
        assert!(matches!(
            build_search_body(&cfg, &[]),
            Err(CompassError::ConflictingFilter { .. })
        ));

        cfg.queries.insert("is_deleted".to_string(), "true".to_string());
        assert!(build_search_body(&cfg, &[]).is_ok());
    }

    #[test]
    fn test_rank_by_and_include_fields() {
        let mut cfg = search("orders");
        cfg.rank_by = "data.profile.usage".to_string();
        cfg.include_fields = vec!["owners".to_string(), "urn".to_string()];
        cfg.max_results = 7;
        cfg.offset = 14;
        let body = build_search_body(&cfg, &[]).unwrap();
        let functions = body["query"]["function_score"]["functions"].as_array().unwrap();
        assert_eq!(functions[0]["weight"], 50);
        assert_eq!(functions[1]["weight"], 10);
        assert_eq!(functions[2]["field_value_factor"]["field"], "data.profile.usage");
        assert_eq!(body["query"]["function_score"]["score_mode"], "sum");
        let includes = body["_source"]["includes"].as_array().unwrap();
        assert_eq!(includes.len(), RETURNED_FIELDS.len() + 1);
        assert_eq!((body["size"].clone(), body["from"].clone()), (json!(7), json!(14)));
    }

    #[test]
    fn test_suggest_body() {
        let body = build_suggest_body(&search("ord"));
        let suggester = &body["suggest"][SUGGESTER_NAME];
        assert_eq!(suggester["completion"]["field"], "name.suggest");
        assert_eq!(suggester["completion"]["size"], 5);
        assert_eq!(suggester["completion"]["skip_duplicates"], true);
    }

    #[test]
    fn test_group_body() {
        let cfg = GroupConfig {
            group_by: vec!["service".to_string(), "is_deleted".to_string()],
            included_fields: vec!["urn".to_string()],
            ..Default::default()
        };
        let body = build_group_body(&cfg).unwrap();
        let agg = &body["aggs"][GROUP_AGGREGATION];
        assert_eq!(agg["composite"]["size"], DEFAULT_GROUP_SIZE);
        assert_eq!(
            agg["composite"]["sources"],
            json!([
                { "service": { "terms": { "field": "service.keyword" } } },
                { "is_deleted": { "terms": { "field": "is_deleted" } } }
            ])
        );
        assert_eq!(
            agg["aggs"][TOP_HITS]["top_hits"]["_source"]["includes"],
            json!(["service", "is_deleted", "urn"])
        );
        assert_eq!(
            body["query"]["bool"]["filter"],
            json!([{ "term": { "is_deleted": false } }])
        );

        assert!(build_group_body(&GroupConfig::default()).is_err());
    }

    #[test]
    fn test_decode_search_results() {
        let body = json!({
            "hits": { "hits": [
                {
                    "_source": {
                        "id": "", "urn": "urn:x:1", "name": "orders", "type": "table",
                        "service": "bq", "labels": { "team": "a" }, "data": { "k": 1 }
                    },
                    "highlight": { "name": ["<em>orders</em>"] }
                }
            ] }
        });
        let results = to_search_results(&body);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "urn:x:1");
        assert_eq!(results[0].title, "orders");
        assert_eq!(results[0].labels["team"], "a");
        assert!(results[0].data.contains_key("_highlight"));
        assert!(to_search_results(&Value::Null).is_empty());
    }

    #[test]
    fn test_decode_suggestions_and_groups() {
        let body = json!({ "suggest": { SUGGESTER_NAME: [
            { "options": [{ "text": "orders" }, { "text": "order_items" }] }
        ] } });
        assert_eq!(to_suggestions(&body).unwrap(), vec!["orders", "order_items"]);
        assert!(to_suggestions(&json!({})).is_err());

        let body = json!({ "aggregations": { GROUP_AGGREGATION: { "buckets": [
            {
                "key": { "service": "bq", "is_deleted": false },
                TOP_HITS: { "hits": { "hits": [
                    { "_source": { "urn": "urn:x:1", "service": "bq", "is_deleted": false } }
                ] } }
            }
        ] } } });
        let groups =
            to_group_results(&body, &["service".to_string(), "is_deleted".to_string()]).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].fields[1].value, "false");
        assert_eq!(groups[0].assets[0].urn, "urn:x:1");
    }
}
