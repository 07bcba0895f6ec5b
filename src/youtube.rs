/*!
YouTube Data API lookups used by the analytics sync. Counts come back as
strings from the API and are parsed defensively.
*/
use crate::models::TopItem;
use crate::{se, utils};

#[derive(serde::Deserialize, Debug)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(serde::Deserialize, Debug)]
pub struct Channel {
    pub id: String,
    pub snippet: ChannelSnippet,
    pub statistics: ChannelStats,
}

#[derive(serde::Deserialize, Debug)]
pub struct ChannelSnippet {
    pub title: String,
}

#[derive(serde::Deserialize, Debug, Default)]
pub struct ChannelStats {
    #[serde(rename = "subscriberCount")]
    pub subscriber_count: Option<String>,
    #[serde(rename = "viewCount")]
    pub view_count: Option<String>,
    #[serde(rename = "videoCount")]
    pub video_count: Option<String>,
}

impl ChannelStats {
    pub fn subscribers(&self) -> i64 {
        parse_count(&self.subscriber_count)
    }
    pub fn views(&self) -> i64 {
        parse_count(&self.view_count)
    }
    pub fn videos(&self) -> i64 {
        parse_count(&self.video_count)
    }
}

fn parse_count(v: &Option<String>) -> i64 {
    v.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[derive(serde::Deserialize, Debug)]
struct SearchItem {
    id: SearchId,
    snippet: VideoSnippet,
}

#[derive(serde::Deserialize, Debug)]
struct SearchId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(serde::Deserialize, Debug)]
struct VideoSnippet {
    title: String,
    #[serde(rename = "channelTitle", default)]
    channel_title: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(serde::Deserialize, Debug, Default)]
struct Thumbnails {
    default: Option<Thumb>,
}

#[derive(serde::Deserialize, Debug)]
struct Thumb {
    url: String,
}

#[derive(serde::Deserialize, Debug)]
struct VideoStatsItem {
    id: String,
    statistics: VideoStatistics,
}

#[derive(serde::Deserialize, Debug, Default)]
struct VideoStatistics {
    #[serde(rename = "viewCount")]
    view_count: Option<String>,
}

async fn get_json<T: serde::de::DeserializeOwned>(url: &str, token: &str) -> crate::Result<T> {
    let mut resp = surf::get(url)
        .header("authorization", format!("Bearer {}", token))
        .send()
        .await
        .map_err(|e| se!("youtube request error {:?}", e))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.body_string().await.unwrap_or_default();
        return Err(se!(
            "youtube returned {} for {}: {}",
            status,
            url,
            utils::truncate(&body, 200)
        )
        .into());
    }
    resp.body_json()
        .await
        .map_err(|e| se!("youtube json error for {}: {}", url, e).into())
}

/// The caller's own channel, if any.
pub async fn channel(token: &str) -> crate::Result<Option<Channel>> {
    let listing: ListResponse<Channel> = get_json(
        "https://www.googleapis.com/youtube/v3/channels?part=snippet,statistics&mine=true",
        token,
    )
    .await?;
    Ok(listing.items.into_iter().next())
}

/// The caller's most-viewed uploads, normalized. View counts come from a
/// second statistics lookup keyed by the ids the search returned.
pub async fn top_videos(token: &str) -> crate::Result<Vec<TopItem>> {
    let search: ListResponse<SearchItem> = get_json(
        "https://www.googleapis.com/youtube/v3/search?part=snippet&forMine=true&type=video&order=viewCount&maxResults=10",
        token,
    )
    .await?;

    let mut items = vec![];
    let mut ids = vec![];
    for entry in search.items {
        let video_id = match entry.id.video_id {
            Some(id) => id,
            None => continue,
        };
        ids.push(video_id.clone());
        items.push(TopItem {
            item_id: video_id,
            name: entry.snippet.title,
            owner: entry.snippet.channel_title,
            popularity: 0,
            media_url: entry.snippet.thumbnails.default.map(|t| t.url),
        });
    }
    if ids.is_empty() {
        return Ok(items);
    }

    let url = format!(
        "https://www.googleapis.com/youtube/v3/videos?part=statistics&id={}",
        ids.join(",")
    );
    let stats: ListResponse<VideoStatsItem> = get_json(&url, token).await?;
    for stat in stats.items {
        if let Some(item) = items.iter_mut().find(|i| i.item_id == stat.id) {
            item.popularity = parse_count(&stat.statistics.view_count);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_stats_parse_string_counts() {
        let listing: ListResponse<Channel> = serde_json::from_value(serde_json::json!({
            "items": [{
                "id": "UCkb1",
                "snippet": { "title": "Backline Records" },
                "statistics": {
                    "subscriberCount": "15400",
                    "viewCount": "2024000",
                    "videoCount": "87"
                }
            }]
        }))
        .unwrap();
        let ch = listing.items.into_iter().next().unwrap();
        assert_eq!(ch.snippet.title, "Backline Records");
        assert_eq!(ch.statistics.subscribers(), 15400);
        assert_eq!(ch.statistics.views(), 2024000);
        assert_eq!(ch.statistics.videos(), 87);
    }

    #[test]
    fn malformed_counts_degrade_to_zero() {
        let stats = ChannelStats {
            subscriber_count: Some("not-a-number".to_string()),
            view_count: None,
            video_count: Some("12".to_string()),
        };
        assert_eq!(stats.subscribers(), 0);
        assert_eq!(stats.views(), 0);
        assert_eq!(stats.videos(), 12);
    }

    #[test]
    fn search_items_without_video_ids_are_skipped() {
        let search: ListResponse<SearchItem> = serde_json::from_value(serde_json::json!({
            "items": [
                { "id": { "videoId": "v1" },
                  "snippet": { "title": "Tour Recap", "channelTitle": "Backline",
                               "thumbnails": { "default": { "url": "https://i.ytimg.com/v1.jpg" } } } },
                { "id": {}, "snippet": { "title": "playlist hit", "channelTitle": "Backline" } }
            ]
        }))
        .unwrap();
        let with_ids: Vec<_> = search
            .items
            .into_iter()
            .filter(|i| i.id.video_id.is_some())
            .collect();
        assert_eq!(with_ids.len(), 1);
        assert_eq!(with_ids[0].snippet.title, "Tour Recap");
    }
}
