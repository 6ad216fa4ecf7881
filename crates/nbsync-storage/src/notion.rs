//! Notion database used as the upsert target.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use nbsync_core::{select_option_name, RemoteRow, RowFields};
use serde_json::{json, Value as JsonValue};

use crate::{RemoteError, RemoteTable};

const BASE_URL: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";

/// Property names in the target database.
pub mod props {
    pub const TITLE: &str = "Name";
    pub const URL: &str = "URL";
    pub const AUTHOR: &str = "Author";
    pub const UNIQUE_ID: &str = "UniqueID";
    pub const PUBLISHED: &str = "Published";
    pub const DESCRIPTION: &str = "Description";
    pub const YEAR: &str = "Year";
    pub const YEAR_MONTH: &str = "YearMonth";
    pub const QUARTER: &str = "Quarter";
    pub const CATEGORY: &str = "Category";
    pub const GROUPS: &str = "Groups";
    pub const CREATED_AT: &str = "CreatedAt";
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: String,
    pub database_id: String,
    pub timeout: Duration,
}

pub struct NotionTable {
    client: reqwest::Client,
    token: String,
    database_id: String,
}

impl NotionTable {
    pub fn new(config: NotionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building notion client")?;
        Ok(Self {
            client,
            token: config.token,
            database_id: config.database_id,
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        body: &JsonValue,
    ) -> Result<JsonValue, RemoteError> {
        let resp = request
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let (code, message) = parse_error_body(&text);
            return Err(RemoteError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl RemoteTable for NotionTable {
    async fn query_by_unique_id(&self, unique_id: &str) -> Result<Vec<RemoteRow>, RemoteError> {
        let url = format!("{}/databases/{}/query", BASE_URL, self.database_id);
        // Two results are enough to notice a duplicate left behind by a racing run.
        let body = json!({
            "filter": {
                "property": props::UNIQUE_ID,
                "rich_text": { "equals": unique_id }
            },
            "page_size": 2
        });
        let value = self.send(self.client.post(&url), &body).await?;
        let results = value
            .get("results")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| RemoteError::Parse("query response has no results array".into()))?;
        results.iter().map(parse_page_row).collect()
    }

    async fn create_row(
        &self,
        fields: &RowFields,
        created_at: DateTime<Utc>,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/pages", BASE_URL);
        let body = json!({
            "parent": { "database_id": self.database_id },
            "properties": row_properties(fields, Some(created_at)),
        });
        let value = self.send(self.client.post(&url), &body).await?;
        value
            .get("id")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| RemoteError::Parse("created page has no id".into()))
    }

    async fn update_row(&self, row_id: &str, fields: &RowFields) -> Result<(), RemoteError> {
        let url = format!("{}/pages/{}", BASE_URL, row_id);
        let body = json!({ "properties": row_properties(fields, None) });
        self.send(self.client.patch(&url), &body).await?;
        Ok(())
    }
}

fn rich_text(content: &str) -> JsonValue {
    if content.is_empty() {
        return json!({ "rich_text": [] });
    }
    json!({ "rich_text": [{ "type": "text", "text": { "content": content } }] })
}

fn select(value: Option<&str>) -> JsonValue {
    match value.map(select_option_name).filter(|v| !v.is_empty()) {
        Some(name) => json!({ "select": { "name": name } }),
        None => json!({ "select": null }),
    }
}

fn date(value: Option<DateTime<Utc>>) -> JsonValue {
    match value {
        Some(instant) => {
            let start = instant.to_rfc3339_opts(SecondsFormat::Millis, true);
            json!({ "date": { "start": start } })
        }
        None => json!({ "date": null }),
    }
}

/// Property payload for a create (`created_at` set) or an update (`None`).
pub fn row_properties(fields: &RowFields, created_at: Option<DateTime<Utc>>) -> JsonValue {
    let groups: Vec<JsonValue> = fields
        .groups
        .iter()
        .map(|g| select_option_name(g))
        .filter(|g| !g.is_empty())
        .map(|name| json!({ "name": name }))
        .collect();
    let url = if fields.link.is_empty() {
        JsonValue::Null
    } else {
        JsonValue::String(fields.link.clone())
    };

    let mut properties = json!({
        props::TITLE: { "title": [{ "type": "text", "text": { "content": fields.title } }] },
        props::URL: { "url": url },
        props::AUTHOR: rich_text(&fields.nickname),
        props::UNIQUE_ID: rich_text(&fields.unique_id),
        props::PUBLISHED: date(fields.published),
        props::DESCRIPTION: rich_text(&fields.description),
        props::YEAR: select(Some(fields.buckets.year.as_str())),
        props::YEAR_MONTH: select(Some(fields.buckets.year_month.as_str())),
        props::QUARTER: select(Some(fields.buckets.quarter.as_str())),
        props::CATEGORY: select(fields.category.as_deref()),
        props::GROUPS: { "multi_select": groups },
    });
    if let (Some(created_at), Some(map)) = (created_at, properties.as_object_mut()) {
        map.insert(props::CREATED_AT.to_string(), date(Some(created_at)));
    }
    properties
}

fn plain_text(value: Option<&JsonValue>) -> String {
    value
        .and_then(JsonValue::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| {
                    p.get("plain_text")
                        .or_else(|| p.get("text").and_then(|t| t.get("content")))
                        .and_then(JsonValue::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Reads the compared fields back out of a Notion page object.
pub fn parse_page_row(page: &JsonValue) -> Result<RemoteRow, RemoteError> {
    let row_id = page
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| RemoteError::Parse("page object has no id".into()))?
        .to_string();
    let properties = page.get("properties").cloned().unwrap_or(JsonValue::Null);

    let title = plain_text(properties.get(props::TITLE).and_then(|p| p.get("title")));
    let unique_id = plain_text(properties.get(props::UNIQUE_ID).and_then(|p| p.get("rich_text")));
    let link = properties
        .get(props::URL)
        .and_then(|p| p.get("url"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let category = properties
        .get(props::CATEGORY)
        .and_then(|p| p.get("select"))
        .and_then(|s| s.get("name"))
        .and_then(JsonValue::as_str)
        .map(ToString::to_string);
    let groups = properties
        .get(props::GROUPS)
        .and_then(|p| p.get("multi_select"))
        .and_then(JsonValue::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| o.get("name").and_then(JsonValue::as_str))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(RemoteRow {
        row_id,
        unique_id,
        title,
        link,
        category,
        groups,
    })
}

fn parse_error_body(text: &str) -> (String, String) {
    match serde_json::from_str::<JsonValue>(text) {
        Ok(value) => (
            value
                .get("code")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown")
                .to_string(),
            value
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or(text)
                .to_string(),
        ),
        Err(_) => ("unknown".to_string(), text.chars().take(200).collect()),
    }
}
