/*!
Per-platform analytics sync: refresh credentials if needed, pull read-only
usage data, persist the normalized snapshot.
*/
use sqlx::PgPool;
use std::collections::HashMap;

use crate::models::{Platform, PlatformConnection, SpotifySnapshot, TopItem, YoutubeSnapshot};
use crate::{crypto, oauth, se, spotify, utils, youtube, CONFIG, LOG};

/// Secondary per-playlist fetches are capped to bound latency and
/// upstream rate-limit exposure.
pub const PLAYLIST_FANOUT: usize = 10;
pub const TOP_LIMIT: usize = 10;

/// Outcome of making a connection's access token usable.
/// valid -> needs_refresh -> valid, or -> needs_reconnect, which is
/// terminal until the user redoes the callback flow.
pub enum FreshToken {
    Ready(String),
    Reconnect(String),
}

pub async fn find_connection(
    pool: &PgPool,
    user_id: &str,
    platform: Platform,
) -> crate::Result<Option<PlatformConnection>> {
    sqlx::query_as::<_, PlatformConnection>(
        "
        select * from platform_connections
        where user_id = $1 and platform = $2 and active
        ",
    )
    .bind(user_id)
    .bind(platform.as_str())
    .fetch_optional(pool)
    .await
    .map_err(|e| se!("error fetching connection {:?}", e).into())
}

/// Return a usable access token for the connection, refreshing it first
/// when the stored expiry is at or before now. Exactly one refresh
/// attempt per call; its failure tells the caller to reconnect.
pub async fn ensure_fresh_token(
    pool: &PgPool,
    conn: &PlatformConnection,
) -> crate::Result<FreshToken> {
    if conn.access_expires > utils::now_seconds()? {
        return Ok(FreshToken::Ready(crypto::open_str(
            &conn.access_token,
            &conn.access_nonce,
        )?));
    }

    let platform = conn.platform()?;
    slog::info!(
        LOG, "access token expired, refreshing";
        "user_id" => &conn.user_id,
        "platform" => platform.as_str(),
    );
    let refresh_token = match (&conn.refresh_token, &conn.refresh_nonce) {
        (Some(t), Some(n)) => crypto::open_str(t, n)?,
        _ => return Ok(FreshToken::Reconnect("no refresh token on record".to_string())),
    };

    let creds = CONFIG.client_creds(platform)?;
    let provider = oauth::provider(platform);
    let grant = match oauth::refresh_grant(&provider, &creds, &refresh_token).await {
        Ok(grant) => grant,
        Err(e) => return Ok(FreshToken::Reconnect(e.to_string())),
    };

    let sealed = crypto::seal_str(&grant.access_token)?;
    let access_expires = utils::epoch_expiration(grant.expires_in.unwrap_or(3600))?;
    sqlx::query(
        "
        update platform_connections
        set access_token = $1, access_nonce = $2, access_expires = $3, modified = now()
        where id = $4
        ",
    )
    .bind(&sealed.value)
    .bind(&sealed.nonce)
    .bind(access_expires)
    .bind(conn.id)
    .execute(pool)
    .await
    .map_err(|e| se!("error persisting refreshed token {:?}", e))?;

    Ok(FreshToken::Ready(grant.access_token))
}

/// Merge listing entries pulled from several sources into one ranked list:
/// dedupe by item id keeping the higher popularity (first seen wins ties),
/// sort descending, truncate.
pub fn merge_top_items(items: Vec<TopItem>, limit: usize) -> Vec<TopItem> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(items.len());
    let mut merged: Vec<TopItem> = Vec::with_capacity(items.len());
    for item in items {
        match index.get(&item.item_id) {
            Some(&at) => {
                if item.popularity > merged[at].popularity {
                    merged[at] = item;
                }
            }
            None => {
                index.insert(item.item_id.clone(), merged.len());
                merged.push(item);
            }
        }
    }
    // stable sort keeps first-seen order between equal scores
    merged.sort_by(|a, b| b.popularity.cmp(&a.popularity));
    merged.truncate(limit);
    merged
}

/// Best-effort spotify snapshot: every sub-call degrades independently
/// to a zero/empty field instead of failing the sync.
pub async fn gather_spotify(token: &str) -> SpotifySnapshot {
    let mut snap = SpotifySnapshot::default();

    match spotify::playlists(token).await {
        Ok((total, lists)) => {
            snap.playlist_count = total;
            let mut pooled = vec![];
            for list in lists.iter().take(PLAYLIST_FANOUT) {
                match spotify::playlist_tracks(token, &list.id).await {
                    Ok(mut tracks) => pooled.append(&mut tracks),
                    Err(e) => slog::error!(
                        LOG, "playlist fetch failed, skipping";
                        "playlist" => &list.id,
                        "err" => e.to_string(),
                    ),
                }
            }
            snap.top_tracks = merge_top_items(pooled, TOP_LIMIT);
        }
        Err(e) => slog::error!(LOG, "playlist listing failed"; "err" => e.to_string()),
    }

    match spotify::saved_track_total(token).await {
        Ok(total) => snap.saved_track_count = total,
        Err(e) => slog::error!(LOG, "saved track count failed"; "err" => e.to_string()),
    }

    match spotify::followed_artist_total(token).await {
        Ok(total) => snap.followed_artist_count = total,
        Err(e) => slog::error!(LOG, "followed artist count failed"; "err" => e.to_string()),
    }

    snap
}

pub async fn gather_youtube(token: &str) -> YoutubeSnapshot {
    let mut snap = YoutubeSnapshot::default();

    match youtube::channel(token).await {
        Ok(Some(ch)) => {
            snap.channel_title = ch.snippet.title;
            snap.subscriber_count = ch.statistics.subscribers();
            snap.view_count = ch.statistics.views();
            snap.video_count = ch.statistics.videos();
        }
        Ok(None) => slog::warn!(LOG, "account has no youtube channel"),
        Err(e) => slog::error!(LOG, "channel lookup failed"; "err" => e.to_string()),
    }

    match youtube::top_videos(token).await {
        Ok(videos) => snap.top_videos = merge_top_items(videos, TOP_LIMIT),
        Err(e) => slog::error!(LOG, "top video lookup failed"; "err" => e.to_string()),
    }

    snap
}

/// Gather the platform's snapshot as a JSON payload, stamped with the
/// platform and sync time.
pub async fn gather(platform: Platform, token: &str) -> crate::Result<serde_json::Value> {
    let mut payload = match platform {
        Platform::Spotify => serde_json::to_value(gather_spotify(token).await),
        Platform::Youtube => serde_json::to_value(gather_youtube(token).await),
        other => return Err(se!("analytics sync is not supported for {}", other).into()),
    }
    .map_err(|e| se!("snapshot serialize error {}", e))?;
    payload["platform"] = serde_json::Value::String(platform.as_str().to_string());
    payload["synced_at"] = serde_json::Value::String(chrono::Utc::now().to_rfc3339());
    Ok(payload)
}

/// Persist the snapshot and bump the connection's last-synced marker.
/// Concurrent syncs race here; last write wins, which is fine for
/// credential/metadata rows.
pub async fn record_snapshot(
    pool: &PgPool,
    conn: &PlatformConnection,
    payload: &serde_json::Value,
) -> crate::Result<()> {
    sqlx::query(
        "
        insert into platform_stats (user_id, platform, payload, synced_at)
        values ($1, $2, $3, now())
        on conflict (user_id, platform) do update set
        payload = excluded.payload, synced_at = now(), modified = now()
        ",
    )
    .bind(&conn.user_id)
    .bind(&conn.platform)
    .bind(payload)
    .execute(pool)
    .await
    .map_err(|e| se!("error upserting platform stats {:?}", e))?;

    sqlx::query(
        "
        update platform_connections
        set last_synced = now(), modified = now()
        where id = $1
        ",
    )
    .bind(conn.id)
    .execute(pool)
    .await
    .map_err(|e| se!("error bumping last_synced {:?}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, popularity: i64) -> TopItem {
        TopItem {
            item_id: id.to_string(),
            name: format!("track-{}", id),
            owner: "artist".to_string(),
            popularity,
            media_url: None,
        }
    }

    #[test]
    fn duplicate_keeps_higher_popularity() {
        let merged = merge_top_items(vec![item("a", 40), item("a", 85)], TOP_LIMIT);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].popularity, 85);
    }

    #[test]
    fn ranking_is_descending_by_popularity() {
        let merged = merge_top_items(vec![item("a", 10), item("b", 99), item("c", 50)], TOP_LIMIT);
        let scores: Vec<i64> = merged.iter().map(|i| i.popularity).collect();
        assert_eq!(scores, vec![99, 50, 10]);
    }

    #[test]
    fn equal_popularity_keeps_first_seen() {
        let mut first = item("a", 60);
        first.name = "first".to_string();
        let mut second = item("a", 60);
        second.name = "second".to_string();
        let merged = merge_top_items(vec![first, second], TOP_LIMIT);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "first");

        // also holds across distinct ids after the sort
        let mut x = item("x", 60);
        x.name = "x-first".to_string();
        let mut y = item("y", 60);
        y.name = "y-second".to_string();
        let merged = merge_top_items(vec![x, y], TOP_LIMIT);
        assert_eq!(merged[0].name, "x-first");
        assert_eq!(merged[1].name, "y-second");
    }

    #[test]
    fn merged_list_is_truncated() {
        let items: Vec<TopItem> = (0..25).map(|i| item(&format!("t{}", i), i)).collect();
        let merged = merge_top_items(items, TOP_LIMIT);
        assert_eq!(merged.len(), TOP_LIMIT);
        assert_eq!(merged[0].popularity, 24);
    }
}
