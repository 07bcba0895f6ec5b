/*!
Read-only spotify listing endpoints used by the analytics sync.
*/
use crate::models::TopItem;
use crate::{se, utils};

#[derive(serde::Deserialize, Debug)]
pub struct Paging<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    pub total: Option<i64>,
}

#[derive(serde::Deserialize, Debug)]
pub struct PlaylistRef {
    pub id: String,
    pub name: String,
}

#[derive(serde::Deserialize, Debug)]
pub struct PlaylistEntry {
    // local files come back with a null track
    pub track: Option<PlaylistTrack>,
}

#[derive(serde::Deserialize, Debug)]
pub struct PlaylistTrack {
    // local tracks have no catalog id either
    pub id: Option<String>,
    pub name: String,
    pub popularity: Option<i64>,
    pub preview_url: Option<String>,
    #[serde(default = "Vec::new")]
    pub artists: Vec<ArtistRef>,
}

#[derive(serde::Deserialize, Debug)]
pub struct ArtistRef {
    pub name: String,
}

#[derive(serde::Deserialize, Debug)]
struct Following {
    artists: Paging<serde_json::Value>,
}

async fn get_json<T: serde::de::DeserializeOwned>(url: &str, token: &str) -> crate::Result<T> {
    let mut resp = surf::get(url)
        .header("authorization", format!("Bearer {}", token))
        .send()
        .await
        .map_err(|e| se!("spotify request error {:?}", e))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.body_string().await.unwrap_or_default();
        return Err(se!(
            "spotify returned {} for {}: {}",
            status,
            url,
            utils::truncate(&body, 200)
        )
        .into());
    }
    resp.body_json()
        .await
        .map_err(|e| se!("spotify json error for {}: {}", url, e).into())
}

/// The caller's playlists: overall total plus the first page of refs.
pub async fn playlists(token: &str) -> crate::Result<(i64, Vec<PlaylistRef>)> {
    let page: Paging<PlaylistRef> =
        get_json("https://api.spotify.com/v1/me/playlists?limit=10", token).await?;
    let total = page.total.unwrap_or(page.items.len() as i64);
    Ok((total, page.items))
}

pub async fn playlist_tracks(token: &str, playlist_id: &str) -> crate::Result<Vec<TopItem>> {
    let url = format!(
        "https://api.spotify.com/v1/playlists/{}/tracks?limit=50",
        playlist_id
    );
    let page: Paging<PlaylistEntry> = get_json(&url, token).await?;
    Ok(page
        .items
        .into_iter()
        .filter_map(|e| e.track)
        .filter_map(to_top_item)
        .collect())
}

pub async fn saved_track_total(token: &str) -> crate::Result<i64> {
    let page: Paging<serde_json::Value> =
        get_json("https://api.spotify.com/v1/me/tracks?limit=1", token).await?;
    Ok(page.total.unwrap_or(0))
}

pub async fn followed_artist_total(token: &str) -> crate::Result<i64> {
    let following: Following = get_json(
        "https://api.spotify.com/v1/me/following?type=artist&limit=1",
        token,
    )
    .await?;
    Ok(following.artists.total.unwrap_or(0))
}

fn to_top_item(t: PlaylistTrack) -> Option<TopItem> {
    let id = t.id?;
    Some(TopItem {
        item_id: id,
        name: t.name,
        owner: t
            .artists
            .first()
            .map(|a| a.name.clone())
            .unwrap_or_default(),
        popularity: t.popularity.unwrap_or(0),
        media_url: t.preview_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_page_parses_and_normalizes() {
        let body = serde_json::json!({
            "items": [
                { "track": {
                    "id": "t1", "name": "Night Drive", "popularity": 71,
                    "preview_url": "https://p.scdn.co/t1",
                    "artists": [{ "name": "Ayra" }, { "name": "Femi" }]
                }},
                // local file: null track, must be skipped
                { "track": null },
                // local track without a catalog id, also skipped
                { "track": { "id": null, "name": "demo.wav", "artists": [] } }
            ],
            "total": 3
        });
        let page: Paging<PlaylistEntry> = serde_json::from_value(body).unwrap();
        let items: Vec<TopItem> = page
            .items
            .into_iter()
            .filter_map(|e| e.track)
            .filter_map(to_top_item)
            .collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, "t1");
        assert_eq!(items[0].owner, "Ayra");
        assert_eq!(items[0].popularity, 71);
        assert_eq!(items[0].media_url.as_deref(), Some("https://p.scdn.co/t1"));
    }

    #[test]
    fn missing_popularity_defaults_to_zero() {
        let track: PlaylistTrack = serde_json::from_value(serde_json::json!({
            "id": "t9", "name": "B-Side", "artists": []
        }))
        .unwrap();
        let item = to_top_item(track).unwrap();
        assert_eq!(item.popularity, 0);
        assert_eq!(item.owner, "");
    }

    #[test]
    fn following_total_parses() {
        let following: Following = serde_json::from_value(serde_json::json!({
            "artists": { "items": [], "total": 42 }
        }))
        .unwrap();
        assert_eq!(following.artists.total, Some(42));
    }
}
