use crate::se;

/// Streaming platforms artists can link to their portal account.
/// Stored as lowercase snake_case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Spotify,
    AppleMusic,
    Youtube,
    Audiomack,
    Boomplay,
    Soundcloud,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Spotify => "spotify",
            Platform::AppleMusic => "apple_music",
            Platform::Youtube => "youtube",
            Platform::Audiomack => "audiomack",
            Platform::Boomplay => "boomplay",
            Platform::Soundcloud => "soundcloud",
        }
    }

    /// Platforms we can pull listening/viewing analytics from.
    /// The rest are connect-only.
    pub fn supports_sync(&self) -> bool {
        matches!(self, Platform::Spotify | Platform::Youtube)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = crate::StringError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "spotify" => Ok(Platform::Spotify),
            "apple_music" => Ok(Platform::AppleMusic),
            "youtube" => Ok(Platform::Youtube),
            "audiomack" => Ok(Platform::Audiomack),
            "boomplay" => Ok(Platform::Boomplay),
            "soundcloud" => Ok(Platform::Soundcloud),
            other => Err(se!("unknown platform {}", other)),
        }
    }
}

/// One user's stored authorization for one platform.
/// At most one row per (user_id, platform), enforced by the upsert.
#[derive(sqlx::FromRow, Debug, serde::Serialize)]
pub struct PlatformConnection {
    pub id: i64,
    // portal user id as issued by the user store
    pub user_id: String,
    pub platform: String,
    // platform access token, AES-256-GCM sealed under ENC_KEY
    // with the nonce generated at seal time
    pub access_token: String,
    pub access_nonce: String,
    // refresh token, sealed the same way. Some platforms omit it
    // on repeat grants, in which case the stored one is kept.
    pub refresh_token: Option<String>,
    pub refresh_nonce: Option<String>,
    // epoch seconds when the current access token expires
    pub access_expires: i64,
    // the platform-side account/channel id, when the platform
    // exposes a profile endpoint
    pub platform_user_id: Option<String>,
    pub active: bool,
    pub last_synced: Option<chrono::DateTime<chrono::Utc>>,
    pub created: chrono::DateTime<chrono::Utc>,
    pub modified: chrono::DateTime<chrono::Utc>,
}

impl PlatformConnection {
    pub fn platform(&self) -> crate::Result<Platform> {
        Ok(self.platform.parse::<Platform>()?)
    }
}

/// Normalized analytics listing entry. Tracks and videos flatten into the
/// same shape: `popularity` is the platform popularity score or view count,
/// `media_url` a preview or thumbnail where one exists.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TopItem {
    pub item_id: String,
    pub name: String,
    pub owner: String,
    pub popularity: i64,
    pub media_url: Option<String>,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct SpotifySnapshot {
    pub playlist_count: i64,
    pub saved_track_count: i64,
    pub followed_artist_count: i64,
    pub top_tracks: Vec<TopItem>,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct YoutubeSnapshot {
    pub channel_title: String,
    pub subscriber_count: i64,
    pub view_count: i64,
    pub video_count: i64,
    pub top_videos: Vec<TopItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_str_round_trip() {
        for p in [
            Platform::Spotify,
            Platform::AppleMusic,
            Platform::Youtube,
            Platform::Audiomack,
            Platform::Boomplay,
            Platform::Soundcloud,
        ] {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
    }

    #[test]
    fn unknown_platform_is_rejected() {
        assert!("napster".parse::<Platform>().is_err());
    }

    #[test]
    fn sync_support_is_limited_to_analytics_platforms() {
        assert!(Platform::Spotify.supports_sync());
        assert!(Platform::Youtube.supports_sync());
        assert!(!Platform::AppleMusic.supports_sync());
        assert!(!Platform::Boomplay.supports_sync());
    }
}
