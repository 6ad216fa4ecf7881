//! Neighbor metadata: the CSV snapshot consumed by the feed run and the
//! admin-page scrape that produces the discovery CSV.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use nbsync_core::{split_group_names, DiscoveredNeighbor, NeighborMeta};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::{extract_blog_id, AdapterError};

const BLOG_ID_ALIASES: &[&str] = &["blogid", "id", "블로그id", "아이디"];
const GROUP_ALIASES: &[&str] = &[
    "groupnames",
    "groups",
    "group",
    "groupname",
    "그룹",
    "그룹명",
];
const NICKNAME_ALIASES: &[&str] = &["nickname", "nick", "name", "닉네임"];
const INFLUENCER_ALIASES: &[&str] = &["influencer", "isinfluencer", "인플루언서"];
const INFLUENCER_HANDLE_ALIASES: &[&str] = &["influencerhandle", "influencerurl", "handle"];

pub const DISCOVERY_HEADER: [&str; 5] = [
    "blogId",
    "blogUrl",
    "neighborCount",
    "scrapCount",
    "influencer",
];

/// Immutable lookup from blog id to neighbor metadata, built once per run.
#[derive(Debug, Clone, Default)]
pub struct NeighborDirectory {
    by_blog: HashMap<String, NeighborMeta>,
}

impl NeighborDirectory {
    pub fn from_entries(entries: impl IntoIterator<Item = NeighborMeta>) -> Self {
        let by_blog = entries
            .into_iter()
            .map(|meta| (meta.blog_id.clone(), meta))
            .collect();
        Self { by_blog }
    }

    pub fn get(&self, blog_id: &str) -> Option<&NeighborMeta> {
        self.by_blog.get(blog_id.trim())
    }

    pub fn len(&self) -> usize {
        self.by_blog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_blog.is_empty()
    }
}

/// Lowercases and drops separators so `Blog_ID`, `blog id` and `blogId` compare equal.
fn normalize_header(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .collect()
}

fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| headers.iter().position(|h| h == alias))
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "y" | "yes" | "o" | "influencer"
    )
}

pub fn load_neighbor_csv(path: impl AsRef<Path>) -> Result<NeighborDirectory, AdapterError> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_neighbor_csv(file)
}

pub fn read_neighbor_csv<R: Read>(reader: R) -> Result<NeighborDirectory, AdapterError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader.headers()?.iter().map(normalize_header).collect();
    let blog_col = find_column(&headers, BLOG_ID_ALIASES).ok_or_else(|| {
        AdapterError::Message(format!("neighbor CSV has no blog id column (headers: {headers:?})"))
    })?;
    let group_col = find_column(&headers, GROUP_ALIASES);
    let nickname_col = find_column(&headers, NICKNAME_ALIASES);
    let influencer_col = find_column(&headers, INFLUENCER_ALIASES);
    let handle_col = find_column(&headers, INFLUENCER_HANDLE_ALIASES);

    let mut entries = Vec::new();
    for row in csv_reader.records() {
        let row = row?;
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };
        let Some(blog_id) = cell(Some(blog_col)) else {
            continue;
        };
        let handle = cell(handle_col);
        entries.push(NeighborMeta {
            blog_id,
            nickname: cell(nickname_col),
            groups: cell(group_col)
                .map(|g| split_group_names(&g))
                .unwrap_or_default(),
            influencer: cell(influencer_col).is_some_and(|v| truthy(&v)) || handle.is_some(),
            influencer_handle: handle,
        });
    }
    Ok(NeighborDirectory::from_entries(entries))
}

pub fn write_discovered_csv(
    path: impl AsRef<Path>,
    neighbors: &[DiscoveredNeighbor],
) -> Result<(), AdapterError> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_discovered(file, neighbors)
}

pub fn write_discovered<W: Write>(
    writer: W,
    neighbors: &[DiscoveredNeighbor],
) -> Result<(), AdapterError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(DISCOVERY_HEADER)?;
    for n in neighbors {
        let count = |v: Option<u64>| v.map(|c| c.to_string()).unwrap_or_default();
        csv_writer.write_record([
            n.blog_id.clone(),
            n.blog_url.clone(),
            count(n.neighbor_count),
            count(n.scrap_count),
            n.influencer.to_string(),
        ])?;
    }
    csv_writer.flush().context("flushing discovery CSV")?;
    Ok(())
}

static NEIGHBOR_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:이웃|neighbou?rs?)\s*(?:수)?\s*[:：]?\s*([\d,]+)")
        .expect("neighbor count pattern compiles")
});

static SCRAP_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:스크랩|scraps?)\s*(?:수)?\s*[:：]?\s*([\d,]+)")
        .expect("scrap count pattern compiles")
});

fn parse_counter(pattern: &Regex, text: &str) -> Option<u64> {
    let caps = pattern.captures(text)?;
    caps[1].replace(',', "").parse().ok()
}

fn neighbor_from_row(row: ElementRef<'_>, anchors: &Selector) -> Option<DiscoveredNeighbor> {
    let hrefs: Vec<&str> = row
        .select(anchors)
        .filter_map(|a| a.value().attr("href"))
        .collect();
    let blog_id = hrefs.iter().find_map(|href| extract_blog_id(href))?;
    let text = row.text().collect::<Vec<_>>().join(" ");
    let lower = text.to_lowercase();
    let influencer = hrefs.iter().any(|href| href.contains("in.naver.com/"))
        || lower.contains("인플루언서")
        || lower.contains("influencer");

    Some(DiscoveredNeighbor {
        blog_url: format!("https://blog.naver.com/{blog_id}"),
        blog_id,
        neighbor_count: parse_counter(&NEIGHBOR_COUNT, &text),
        scrap_count: parse_counter(&SCRAP_COUNT, &text),
        influencer,
    })
}

/// Extracts one neighbor per table row (or list item when the page has no usable rows).
pub fn parse_neighbor_admin_page(body: &str) -> Vec<DiscoveredNeighbor> {
    let document = Html::parse_document(body);
    let anchors = Selector::parse("a[href]").expect("static selector parses");

    let mut found: Vec<DiscoveredNeighbor> = Vec::new();
    for row_selector in ["tr", "li"] {
        let rows = Selector::parse(row_selector).expect("static selector parses");
        for row in document.select(&rows) {
            if let Some(neighbor) = neighbor_from_row(row, &anchors) {
                if !found.iter().any(|n| n.blog_id == neighbor.blog_id) {
                    found.push(neighbor);
                }
            }
        }
        if !found.is_empty() {
            break;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn csv_aliases_and_delimiters() {
        let data = "\u{feff}Blog_ID,닉네임,Group Names,Influencer\n\
                    alice,Alice,\"Finance,Tech\",\n\
                    bob,Bob,Travel|Food,yes\n\
                    ,Nobody,Ignored,\n";
        let dir = read_neighbor_csv(data.as_bytes()).unwrap();
        assert_eq!(dir.len(), 2);
        let alice = dir.get("alice").unwrap();
        assert_eq!(alice.nickname.as_deref(), Some("Alice"));
        assert_eq!(alice.groups, vec!["Finance", "Tech"]);
        assert!(!alice.influencer);
        let bob = dir.get("bob").unwrap();
        assert_eq!(bob.groups, vec!["Travel", "Food"]);
        assert!(bob.influencer);
    }

    #[test]
    fn csv_without_blog_id_column_is_rejected() {
        let err = read_neighbor_csv("nickname,groups\nAlice,Tech\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("blog id"));
    }

    #[test]
    fn later_rows_override_earlier_ones() {
        let dir = read_neighbor_csv("id,group\nalice,Old\nalice,New\n".as_bytes()).unwrap();
        assert_eq!(dir.get("alice").unwrap().groups, vec!["New"]);
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "blogId,groupName,influencerHandle").unwrap();
        writeln!(file, "carol,Tech,https://in.naver.com/carol").unwrap();
        let dir = load_neighbor_csv(file.path()).unwrap();
        let carol = dir.get("carol").unwrap();
        assert!(carol.influencer);
        assert_eq!(carol.influencer_handle.as_deref(), Some("https://in.naver.com/carol"));
    }

    #[test]
    fn discovery_csv_has_fixed_columns_and_quotes() {
        let neighbors = vec![
            DiscoveredNeighbor {
                blog_id: "alice".into(),
                blog_url: "https://blog.naver.com/alice".into(),
                neighbor_count: Some(1200),
                scrap_count: None,
                influencer: true,
            },
            DiscoveredNeighbor {
                blog_id: "odd,\"id\"".into(),
                blog_url: "https://blog.naver.com/odd".into(),
                neighbor_count: Some(3),
                scrap_count: Some(4),
                influencer: false,
            },
        ];
        let mut out = Vec::new();
        write_discovered(&mut out, &neighbors).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "blogId,blogUrl,neighborCount,scrapCount,influencer");
        assert_eq!(lines[1], "alice,https://blog.naver.com/alice,1200,,true");
        assert_eq!(lines[2], "\"odd,\"\"id\"\"\",https://blog.naver.com/odd,3,4,false");
    }

    #[test]
    fn admin_rows_yield_ids_counters_and_influencer_flag() {
        let html = r#"
            <table>
              <tr><th>블로그</th><th>이웃</th></tr>
              <tr>
                <td><a href="https://blog.naver.com/alice">Alice</a></td>
                <td>이웃 1,204</td><td>스크랩 37</td>
              </tr>
              <tr>
                <td><a href="https://blog.naver.com/PostList.naver?blogId=bob">Bob</a>
                    <a href="https://in.naver.com/bobtravels">in</a></td>
                <td>Neighbors: 88</td>
              </tr>
              <tr><td><a href="https://blog.naver.com/alice">Alice again</a></td></tr>
              <tr><td>no link here</td></tr>
            </table>"#;
        let found = parse_neighbor_admin_page(html);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].blog_id, "alice");
        assert_eq!(found[0].neighbor_count, Some(1204));
        assert_eq!(found[0].scrap_count, Some(37));
        assert!(!found[0].influencer);
        assert_eq!(found[1].blog_id, "bob");
        assert_eq!(found[1].blog_url, "https://blog.naver.com/bob");
        assert_eq!(found[1].neighbor_count, Some(88));
        assert!(found[1].influencer);
    }

    #[test]
    fn admin_list_items_are_used_when_no_table_rows_match() {
        let html = r#"<ul><li><a href="https://m.blog.naver.com/dave/">Dave</a> 인플루언서</li></ul>"#;
        let found = parse_neighbor_admin_page(html);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].blog_id, "dave");
        assert!(found[0].influencer);
    }
}
