//! Settings and mappings of a per-service index.

use serde_json::{json, Value};

/// Body of a create-index request. Indices created for a service are
/// attached to `alias` when given.
pub fn index_definition(alias: Option<&str>) -> Value {
    let mut definition = json!({
        "settings": {
            "analysis": {
                "analyzer": {
                    "my_analyzer": {
                        "type": "custom",
                        "tokenizer": "my_tokenizer",
                        "filter": ["lowercase"]
                    }
                },
                "tokenizer": {
                    "my_tokenizer": {
                        "type": "pattern",
                        "pattern": "([^\\p{L}\\d]+)|(?<=\\D)(?=\\d)|(?<=\\d)(?=\\D)|(?<=[\\p{L}&&[^\\p{Lu}]])(?=\\p{Lu})|(?<=\\p{Lu})(?=\\p{Lu}[\\p{L}&&[^\\p{Lu}]])"
                    }
                }
            }
        },
        "mappings": {
            "dynamic_templates": [
                {
                    "strings": {
                        "match_mapping_type": "string",
                        "mapping": {
                            "type": "text",
                            "analyzer": "my_analyzer",
                            "fields": {
                                "keyword": { "type": "keyword", "ignore_above": 256 }
                            }
                        }
                    }
                }
            ],
            "properties": {
                "urn": text_with_keyword(),
                "name": {
                    "type": "text",
                    "analyzer": "my_analyzer",
                    "fields": {
                        "keyword": { "type": "keyword", "ignore_above": 256 },
                        "suggest": { "type": "completion" }
                    }
                },
                "description": text_with_keyword(),
                "service": text_with_keyword(),
                "type": text_with_keyword(),
                "is_deleted": { "type": "boolean" },
                "created_at": { "type": "date" },
                "updated_at": { "type": "date" },
                "refreshed_at": { "type": "date" }
            }
        }
    });
    if let Some(alias) = alias {
        definition["aliases"] = json!({ alias: {} });
    }
    definition
}

fn text_with_keyword() -> Value {
    json!({
        "type": "text",
        "analyzer": "my_analyzer",
        "fields": {
            "keyword": { "type": "keyword", "ignore_above": 256 }
        }
    })
}
